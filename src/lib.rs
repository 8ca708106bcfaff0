#[macro_use]
extern crate log;
extern crate byteorder;
extern crate libc;

pub mod config;
pub mod error;
pub mod http;
pub mod ipv4;
pub mod platform;
pub mod socket;
pub mod tcp;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::socket::{Event, EventKind, Listener, Socket};
