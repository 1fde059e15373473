//! Transport configuration.

use std::time::Duration;

/// Tunable parameters for a transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Max time waiting for a bootstrap handshake with one candidate.
    pub bootstrap_connect_timeout: Duration,

    /// Post-success lifetime of a bootstrap connection before it must be
    /// upgraded to permanent.
    pub bootstrap_connection_lifespan: Duration,

    /// Max time waiting for a rendezvous handshake.
    pub rendezvous_connect_timeout: Duration,

    /// Hard cap on normal connections per transport.
    pub max_connections: usize,

    /// Interval between handshake retransmissions while connecting.
    pub handshake_retry_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bootstrap_connect_timeout: Duration::from_secs(3),
            bootstrap_connection_lifespan: Duration::from_secs(600),
            rendezvous_connect_timeout: Duration::from_secs(10),
            max_connections: 50,
            handshake_retry_interval: Duration::from_millis(250),
        }
    }
}

/// Builder for a [`TransportConfig`].
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Create a builder holding the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-candidate bootstrap handshake timeout.
    pub fn bootstrap_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.bootstrap_connect_timeout = timeout;
        self
    }

    /// Set the bootstrap connection lifespan.
    pub fn bootstrap_connection_lifespan(mut self, lifespan: Duration) -> Self {
        self.config.bootstrap_connection_lifespan = lifespan;
        self
    }

    /// Set the rendezvous handshake timeout.
    pub fn rendezvous_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.rendezvous_connect_timeout = timeout;
        self
    }

    /// Set the cap on normal connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the handshake retransmission interval.
    pub fn handshake_retry_interval(mut self, interval: Duration) -> Self {
        self.config.handshake_retry_interval = interval;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TransportConfigBuilder::new()
            .bootstrap_connect_timeout(Duration::from_millis(500))
            .max_connections(8)
            .build();

        assert_eq!(config.bootstrap_connect_timeout, Duration::from_millis(500));
        assert_eq!(config.max_connections, 8);
        // Untouched fields keep their defaults.
        assert_eq!(
            config.rendezvous_connect_timeout,
            TransportConfig::default().rendezvous_connect_timeout
        );
    }
}
