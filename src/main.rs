use std::process;

use log::{error, warn};
use structopt::StructOpt;

use rawtcp::http;
use rawtcp::ipv4;
use rawtcp::platform::RawNetwork;
use rawtcp::socket::Socket;
use rawtcp::tcp::Endpoint;
use rawtcp::{Config, Error, Result};

#[derive(Clone, StructOpt)]
#[structopt(name = "rawtcp", about = "TCP over raw IP sockets, with the DTH flag")]
enum Command {
    /// Request `/` from an HTTP server and print the reply.
    #[structopt(name = "get")]
    Get(GetArgs),

    /// Post a body to an HTTP server and print the reply.
    #[structopt(name = "post")]
    Post(PostArgs),

    /// Push bytes to a server and close.
    #[structopt(name = "send")]
    Send(SendArgs),

    /// Accept sessions one after the other, answering requests with a canned body. Run with
    /// `RUST_LOG=info` to see each session.
    #[structopt(name = "serve")]
    Serve(ServeArgs),
}

#[derive(Clone, StructOpt)]
struct GetArgs {
    #[structopt(long = "client", default_value = "127.0.0.1")]
    client: ipv4::Address,
    server: ipv4::Address,
    port: u16,
    /// Print the full reply instead of just the body.
    #[structopt(short = "i", long = "include")]
    include: bool,
}

#[derive(Clone, StructOpt)]
struct PostArgs {
    #[structopt(long = "client", default_value = "127.0.0.1")]
    client: ipv4::Address,
    server: ipv4::Address,
    port: u16,
    body: String,
    #[structopt(short = "i", long = "include")]
    include: bool,
}

#[derive(Clone, StructOpt)]
struct SendArgs {
    #[structopt(long = "client", default_value = "127.0.0.1")]
    client: ipv4::Address,
    server: ipv4::Address,
    port: u16,
    data: String,
}

#[derive(Clone, StructOpt)]
struct ServeArgs {
    #[structopt(default_value = "127.0.0.1")]
    addr: ipv4::Address,
    #[structopt(default_value = "18000")]
    port: u16,
    #[structopt(long = "body", default_value = "hello from rawtcp\n")]
    body: String,
    /// Echo timestamps on acknowledgments of data.
    #[structopt(long = "timestamps")]
    timestamps: bool,
}

fn main() {
    env_logger::init();

    let result = match Command::from_args() {
        Command::Get(args) => get(args),
        Command::Post(args) => post(args),
        Command::Send(args) => send(args),
        Command::Serve(args) => serve(args),
    };

    if let Err(err) = result {
        error!("{}", err);
        process::exit(1);
    }
}

fn get(args: GetArgs) -> Result<()> {
    let reply = http::get(args.client, args.server, args.port);
    show(reply, args.server, args.port, args.include)
}

fn post(args: PostArgs) -> Result<()> {
    let reply = http::post(args.client, args.server, args.port, &args.body);
    show(reply, args.server, args.port, args.include)
}

/// Print a reply, or its body alone. A session the server ended still has a reply to print.
fn show(reply: Result<String>, server: ipv4::Address, port: u16, include: bool) -> Result<()> {
    let text = match reply {
        Ok(text) => text,
        Err(Error::SessionTerminated(reply)) => {
            warn!("session terminated by {}:{}", server, port);
            String::from_utf8_lossy(&reply).into_owned()
        }
        Err(err) => return Err(err),
    };

    if include {
        print!("{}", text);
    } else {
        print!("{}", http::parse_response(&text).body);
    }
    Ok(())
}

fn send(args: SendArgs) -> Result<()> {
    let mut socket = Socket::dial(args.client, args.server, args.port)?;
    socket.send(args.data.as_bytes())?;
    socket.close()
}

fn serve(args: ServeArgs) -> Result<()> {
    let local = Endpoint::new(args.addr, args.port);
    let mut config = Config::default().with_responder(http::responder(&args.body));
    config.timestamps = args.timestamps;

    println!("serving on {}", local);
    http::listen_and_serve(RawNetwork, config, local)
}
