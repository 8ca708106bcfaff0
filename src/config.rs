use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

/// Builds the application reply a server sends back on its app port.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Constants and knobs shared by both ends of an exchange.
#[derive(Clone)]
pub struct Config {
    /// Sequence number of the initial SYN.
    pub client_isn: u32,
    /// Sequence number of the SYN+ACK.
    pub server_isn: u32,
    /// Advertised on every segment we build.
    pub window: u16,
    /// Timestamp value carried by the SYN option set.
    pub syn_timestamp: u32,
    /// Ephemeral ports `dial` draws from.
    pub port_range: RangeInclusive<u16>,
    /// Port on which an accepting server answers requests and ends the exchange with DTH.
    pub app_port: u16,
    pub responder: Option<Responder>,
    /// Echo the peer's timestamp on acknowledgments of data.
    pub timestamps: bool,
    /// How long the dispatcher blocks on a read before checking whether it should stop. Raw
    /// sockets wait at least a microsecond.
    pub recv_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client_isn: 209828892,
            server_isn: 0,
            window: 65495,
            syn_timestamp: 3766008248,
            port_range: 50000..=60000,
            app_port: 18000,
            responder: None,
            timestamps: false,
            recv_timeout: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn with_responder<F>(mut self, responder: F) -> Self
        where F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static
    {
        self.responder = Some(Arc::new(responder));
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_isn", &self.client_isn)
            .field("server_isn", &self.server_isn)
            .field("window", &self.window)
            .field("syn_timestamp", &self.syn_timestamp)
            .field("port_range", &self.port_range)
            .field("app_port", &self.app_port)
            .field("responder", &self.responder.is_some())
            .field("timestamps", &self.timestamps)
            .field("recv_timeout", &self.recv_timeout)
            .finish()
    }
}
