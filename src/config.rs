use std::fmt;
use std::time::Duration;

use crate::message::options::BlockValue;

/// Transmission parameters of a stack (RFC 7252 §4.8, RFC 7959).
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Initial retransmission timeout before randomization.
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    /// Outstanding requests allowed per peer.
    pub nstart: usize,
    pub default_leisure: Duration,
    /// Bytes per second towards a peer that does not respond.
    pub probing_rate: f64,
    /// Payloads above this many bytes are sent blockwise.
    pub max_message_size: usize,
    pub default_block_size: usize,
    /// Largest body reassembled from blocks; bigger uploads get 4.13.
    pub max_resource_body_size: usize,
    /// Period of the deduplication sweep.
    pub mark_and_sweep_interval: Duration,
    /// How long a deduplication entry stays valid.
    pub exchange_lifetime: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            default_leisure: Duration::from_secs(5),
            probing_rate: 1.0,
            max_message_size: 1024,
            default_block_size: 512,
            max_resource_body_size: 8192,
            mark_and_sweep_interval: Duration::from_secs(10),
            exchange_lifetime: Duration::from_secs(247),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    ZeroAckTimeout,
    RandomFactorBelowOne(f64),
    InvalidBlockSize(usize),
    ZeroMessageSize,
    ZeroNstart,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ZeroAckTimeout => write!(f, "ack_timeout must be positive"),
            ConfigError::RandomFactorBelowOne(v) => {
                write!(f, "ack_random_factor must be at least 1.0, got {}", v)
            }
            ConfigError::InvalidBlockSize(v) => {
                write!(f, "default_block_size must be a power of two in 16..=1024, got {}", v)
            }
            ConfigError::ZeroMessageSize => write!(f, "max_message_size must be positive"),
            ConfigError::ZeroNstart => write!(f, "nstart must be positive"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl NetworkConfig {
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_ack_random_factor(mut self, ack_random_factor: f64) -> Self {
        self.ack_random_factor = ack_random_factor;
        self
    }

    pub fn with_max_retransmit(mut self, max_retransmit: u32) -> Self {
        self.max_retransmit = max_retransmit;
        self
    }

    pub fn with_nstart(mut self, nstart: usize) -> Self {
        self.nstart = nstart;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_default_block_size(mut self, default_block_size: usize) -> Self {
        self.default_block_size = default_block_size;
        self
    }

    pub fn with_max_resource_body_size(mut self, max_resource_body_size: usize) -> Self {
        self.max_resource_body_size = max_resource_body_size;
        self
    }

    pub fn with_mark_and_sweep_interval(mut self, interval: Duration) -> Self {
        self.mark_and_sweep_interval = interval;
        self
    }

    pub fn with_exchange_lifetime(mut self, exchange_lifetime: Duration) -> Self {
        self.exchange_lifetime = exchange_lifetime;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::ZeroAckTimeout);
        }
        if !(self.ack_random_factor >= 1.0) {
            return Err(ConfigError::RandomFactorBelowOne(self.ack_random_factor));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }
        if self.nstart == 0 {
            return Err(ConfigError::ZeroNstart);
        }
        self.default_szx()?;
        Ok(())
    }

    /// SZX of the configured default block size.
    pub fn default_szx(&self) -> Result<u8, ConfigError> {
        BlockValue::size_to_exponent(self.default_block_size)
            .map_err(|_| ConfigError::InvalidBlockSize(self.default_block_size))
    }

    /// Time from the first transmission of a CON to its last retransmission.
    pub fn max_transmit_span(&self) -> Duration {
        let span = ((1u64 << self.max_retransmit) - 1) as f64 * self.ack_random_factor;
        self.ack_timeout.mul_f64(span)
    }

    /// Time from the first transmission of a CON until the sender gives up.
    pub fn max_transmit_wait(&self) -> Duration {
        let wait = ((1u64 << (self.max_retransmit + 1)) - 1) as f64 * self.ack_random_factor;
        self.ack_timeout.mul_f64(wait)
    }
}
