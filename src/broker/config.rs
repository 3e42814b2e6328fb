// Process-wide broker settings

/// Broker configuration, fixed at startup. Nothing here is persisted;
/// a restart forgets all connections and messages.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listener port; 0 picks an ephemeral port.
    pub tcp_port: u16,
    /// Bound of every internal queue: session inbound/outbound queues,
    /// the subscriber registry claim channel, and per-recipient message
    /// queues.
    pub tbq_size: usize,
    /// Byte length of generated recipient and sender ids.
    pub queue_id_bytes: usize,
    /// Byte length of generated message ids.
    pub msg_id_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: 5223,
            tbq_size: 32,
            queue_id_bytes: 24,
            msg_id_bytes: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.tcp_port, 5223);
        assert_eq!(config.tbq_size, 32);
        assert_eq!(config.queue_id_bytes, 24);
        assert_eq!(config.msg_id_bytes, 16);
    }
}
