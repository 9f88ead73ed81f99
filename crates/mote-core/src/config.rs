//! Engine configuration and server accounts.
//!
//! Defaults follow RFC 7252 §4.8 transmission parameters and RFC 7959 block
//! sizes. The backoff cap is not in the RFC; it bounds the doubling so that a
//! raised `max_retransmit` cannot push retries hours apart.

use std::{fmt, time::Duration};

use mote_proto::{Binding, block::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE}};

use crate::error::ConfigError;

/// Ceiling for any single transmission timer.
const MAX_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

/// Ceiling for `ack_random_factor`.
const MAX_RANDOM_FACTOR: f64 = 16.0;

/// Confirmable retransmission parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionConfig {
    /// Base timeout before the first retransmission.
    pub ack_timeout: Duration,
    /// Initial timeout is drawn from `[ack_timeout, ack_timeout * factor)`.
    pub ack_random_factor: f64,
    /// Retransmissions before a confirmable request times out.
    pub max_retransmit: u8,
    /// Upper bound for the doubled timeout.
    pub max_backoff: Duration,
    /// How long a non-confirmable request waits for its response.
    pub non_lifetime: Duration,
    /// How long to wait for a separate response after an empty ACK.
    pub separate_response_timeout: Duration,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            max_backoff: Duration::from_secs(60),
            non_lifetime: Duration::from_secs(145),
            separate_response_timeout: Duration::from_secs(93),
        }
    }
}

impl TransmissionConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_timeout.is_zero() {
            return Err(invalid("ack_timeout", "must be positive"));
        }
        if !(1.0..=MAX_RANDOM_FACTOR).contains(&self.ack_random_factor) {
            return Err(invalid("ack_random_factor", format!("must be within 1.0..={MAX_RANDOM_FACTOR}")));
        }
        if self.max_backoff < self.ack_timeout {
            return Err(invalid("max_backoff", "must not be below ack_timeout"));
        }
        for (field, timer) in [
            ("ack_timeout", self.ack_timeout),
            ("max_backoff", self.max_backoff),
            ("non_lifetime", self.non_lifetime),
            ("separate_response_timeout", self.separate_response_timeout),
        ] {
            if timer > MAX_TIMER {
                return Err(invalid(field, format!("must not exceed {}s", MAX_TIMER.as_secs())));
            }
        }
        Ok(())
    }

    /// How long a message ID stays in use for duplicate detection
    /// (`EXCHANGE_LIFETIME`, RFC 7252 §4.8.2, with `MAX_LATENCY` of 100 s).
    pub fn exchange_lifetime(&self) -> Duration {
        const MAX_LATENCY: Duration = Duration::from_secs(100);
        let attempts = (1u32 << u32::from(self.max_retransmit.min(16))) - 1;
        let span = (self.ack_timeout * attempts).mul_f64(self.ack_random_factor);
        span + MAX_LATENCY * 2 + self.ack_timeout
    }
}

/// Block-wise transfer limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockConfig {
    /// Smallest block size accepted.
    pub min_block_size: u16,
    /// Largest block size accepted and the size used for Block2 replies.
    pub max_block_size: u16,
    /// Largest reassembled body.
    pub max_transfer_bytes: usize,
    /// Transfers idle for longer than this are discarded.
    pub transfer_timeout: Duration,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            min_block_size: MIN_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            max_transfer_bytes: 64 * 1024,
            transfer_timeout: Duration::from_secs(247),
        }
    }
}

impl BlockConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, size) in [("min_block_size", self.min_block_size), ("max_block_size", self.max_block_size)] {
            if !size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
                return Err(invalid(field, format!("{size} is not a power of two in 16..=1024")));
            }
        }
        if self.min_block_size > self.max_block_size {
            return Err(invalid("min_block_size", "exceeds max_block_size"));
        }
        if self.max_transfer_bytes == 0 {
            return Err(invalid("max_transfer_bytes", "must be positive"));
        }
        Ok(())
    }

    /// `size` is a power of two within `[min, max]`.
    pub fn accepts(&self, size: u16) -> bool {
        size.is_power_of_two() && (self.min_block_size..=self.max_block_size).contains(&size)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Retransmission parameters.
    pub transmission: TransmissionConfig,
    /// Block-wise transfer limits.
    pub block: BlockConfig,
    /// A bootstrap exchange fails if the bootstrap server stays silent this
    /// long.
    pub bootstrap_timeout: Duration,
    /// Wake durations are rounded up to a multiple of this.
    pub clock_granularity: Duration,
    /// Wake duration reported when nothing is pending.
    pub idle_wake: Duration,
    /// LwM2M version advertised at registration.
    pub lwm2m_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transmission: TransmissionConfig::default(),
            block: BlockConfig::default(),
            bootstrap_timeout: Duration::from_secs(247),
            clock_granularity: Duration::from_millis(10),
            idle_wake: Duration::from_secs(60),
            lwm2m_version: "1.1".to_string(),
        }
    }
}

impl EngineConfig {
    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transmission.validate()?;
        self.block.validate()?;
        if self.bootstrap_timeout.is_zero() {
            return Err(invalid("bootstrap_timeout", "must be positive"));
        }
        if self.clock_granularity.is_zero() {
            return Err(invalid("clock_granularity", "must be positive"));
        }
        if self.idle_wake < self.clock_granularity {
            return Err(invalid("idle_wake", "must not be below clock_granularity"));
        }
        Ok(())
    }
}

/// Pre-shared key credentials, carried opaquely for the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct Psk {
    /// PSK identity.
    pub identity: Vec<u8>,
    /// Secret key.
    pub key: Vec<u8>,
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Psk")
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// One LwM2M server or bootstrap server the client talks to.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerAccount {
    /// Short server id. Bootstrap servers use 0.
    pub short_id: u16,
    /// Server URI, `coap://host:port` or `coaps://host:port`.
    pub uri: String,
    /// This is a bootstrap server.
    pub bootstrap: bool,
    /// Registration lifetime.
    pub lifetime: Duration,
    /// Binding advertised at registration.
    pub binding: Binding,
    /// Send notifications as CON instead of NON.
    pub confirmable_notifications: bool,
    /// Security credentials.
    pub psk: Option<Psk>,
}

impl ServerAccount {
    /// Short id used by bootstrap accounts.
    pub const BOOTSTRAP_SHORT_ID: u16 = 0;

    /// Default registration lifetime (LwM2M /1/x/1 default).
    pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(86_400);

    /// Management server account.
    pub fn server(short_id: u16, uri: impl Into<String>) -> Self {
        Self {
            short_id,
            uri: uri.into(),
            bootstrap: false,
            lifetime: Self::DEFAULT_LIFETIME,
            binding: Binding::U,
            confirmable_notifications: false,
            psk: None,
        }
    }

    /// Bootstrap server account.
    pub fn bootstrap(uri: impl Into<String>) -> Self {
        Self { short_id: Self::BOOTSTRAP_SHORT_ID, bootstrap: true, ..Self::server(0, uri) }
    }

    /// Set the registration lifetime.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the binding.
    #[must_use]
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.binding = binding;
        self
    }

    /// Send notifications confirmable.
    #[must_use]
    pub fn with_confirmable_notifications(mut self) -> Self {
        self.confirmable_notifications = true;
        self
    }

    /// Attach PSK credentials.
    #[must_use]
    pub fn with_psk(mut self, identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        self.psk = Some(Psk { identity: identity.into(), key: key.into() });
        self
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.is_empty() {
            return Err(invalid("uri", "must not be empty"));
        }
        if self.bootstrap {
            return Ok(());
        }
        if self.short_id == 0 || self.short_id == u16::MAX {
            return Err(invalid("short_id", format!("{} is reserved", self.short_id)));
        }
        if self.lifetime < Duration::from_secs(1) {
            return Err(invalid("lifetime", "must be at least one second"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField { field, reason: reason.into() }
}
