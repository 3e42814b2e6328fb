// CLI arguments for the broker binary

use crate::broker::config::ServerConfig;
use clap::Parser;

/// Broker command line
#[derive(Debug, Parser)]
#[command(name = "smpd")]
#[command(about = "In-memory simplex messaging protocol broker")]
pub struct BrokerCli {
    /// TCP port to listen on (0 picks an ephemeral port)
    #[arg(short, long, default_value = "5223")]
    pub port: u16,

    /// Bound of every internal queue
    #[arg(long, default_value = "32")]
    pub queue_size: usize,

    /// Byte length of generated queue ids
    #[arg(long, default_value = "24")]
    pub queue_id_bytes: usize,

    /// Byte length of generated message ids
    #[arg(long, default_value = "16")]
    pub msg_id_bytes: usize,
}

impl BrokerCli {
    /// Parse from command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Convert into the broker configuration
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            tcp_port: self.port,
            tbq_size: self.queue_size,
            queue_id_bytes: self.queue_id_bytes,
            msg_id_bytes: self.msg_id_bytes,
        }
    }
}
