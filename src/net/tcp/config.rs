use serde::{Deserialize, Serialize};

/// Configuration for the TCP backend.
///
/// ## Socket options
///
/// - no_delay: When enabled (default), disables Nagle's algorithm for lower latency
///
/// ## Buffers
///
/// - buffer_size: Size of the read buffers taken from the pool
/// - pool_size: Buffers allocated up front; the pool grows on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Size of each pooled read buffer
    pub buffer_size: usize,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    /// Number of read buffers allocated up front
    pub pool_size: usize,
}

impl TcpConfig {
    /// Create a new builder for TcpConfig
    pub fn builder() -> TcpConfigBuilder {
        TcpConfigBuilder::new()
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            no_delay: true,
            pool_size: 16,
        }
    }
}

/// Builder for TcpConfig.
///
/// All fields are optional and will use defaults from TcpConfig::default()
/// if not explicitly set.
#[derive(Debug, Default)]
pub struct TcpConfigBuilder {
    buffer_size: Option<usize>,
    no_delay: Option<bool>,
    pool_size: Option<usize>,
}

impl TcpConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read buffer size. Zero is ignored.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn build(self) -> TcpConfig {
        let default = TcpConfig::default();
        TcpConfig {
            buffer_size: self
                .buffer_size
                .filter(|size| *size > 0)
                .unwrap_or(default.buffer_size),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            pool_size: self.pool_size.unwrap_or(default.pool_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = TcpConfig::builder()
            .buffer_size(0)
            .no_delay(false)
            .pool_size(4)
            .build();
        assert_eq!(config.buffer_size, 8192);
        assert!(!config.no_delay);
        assert_eq!(config.pool_size, 4);

        let parsed: TcpConfig = serde_json::from_str(r#"{"buffer_size":1024}"#).unwrap();
        assert_eq!(parsed.buffer_size, 1024);
        assert!(parsed.no_delay);
    }
}
