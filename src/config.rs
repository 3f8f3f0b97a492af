//! Gateway configuration: an immutable value built once (directly or via
//! [`GatewayBuilder`]) and handed to [`crate::Gateway::run`].

use std::time::Duration;

use crate::buffer::MTU;
use crate::dialer::DIAL_TIMEOUT;
use crate::tcp::state::{ACK_DELAY, IDLE_TIMEOUT};

/// Immutable runtime configuration for a [`crate::Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mtu: usize,
    pub max_window: u16,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub ack_delay: Duration,
    pub max_tcp_input_queue: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            mtu: MTU,
            max_window: u16::MAX,
            dial_timeout: DIAL_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            ack_delay: ACK_DELAY,
            max_tcp_input_queue: 64,
        }
    }
}

/// Chainable, `#[must_use]` builder for [`GatewayConfig`].
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct GatewayBuilder {
    config: GatewayConfig,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        GatewayBuilder::default()
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_max_window(mut self, max_window: u16) -> Self {
        self.config.max_window = max_window;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.config.ack_delay = delay;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_max_tcp_input_queue(mut self, depth: usize) -> Self {
        self.config.max_tcp_input_queue = depth;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.mtu, MTU);
        assert_eq!(config.dial_timeout, DIAL_TIMEOUT);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = GatewayBuilder::new()
            .with_mtu(1500)
            .with_max_tcp_input_queue(128)
            .build();
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.max_tcp_input_queue, 128);
    }
}
