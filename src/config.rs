//! Configuration and builders.
//!
//! The on-disk format itself has no configuration surface -- it's fixed by
//! the wire format in [`crate::format`]. What's configurable is how the
//! layers above it behave: how many pending entries a
//! [`crate::buffered::BufferedDatabase`] accumulates before flushing.

use snafu::Snafu;

use crate::buffered::{DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};

/// Error returned when a configuration value is invalid.
#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Validated configuration for a [`crate::buffered::BufferedDatabase`].
#[derive(Clone, Copy, Debug)]
pub struct BufferedDatabaseConfig {
    pub(crate) buffer_size: usize,
}

impl BufferedDatabaseConfig {
    /// Starts a builder with every field defaulted.
    pub fn builder() -> BufferedDatabaseConfigBuilder {
        BufferedDatabaseConfigBuilder::default()
    }

    /// The configured buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferedDatabaseConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Builder for [`BufferedDatabaseConfig`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferedDatabaseConfigBuilder {
    buffer_size: Option<usize>,
}

impl BufferedDatabaseConfigBuilder {
    /// Sets the number of pending entries the buffer accumulates before
    /// flushing them as a single batch. Larger buffers amortize per-batch
    /// overhead at the cost of holding more unflushed data in memory.
    ///
    /// Defaults to 4096. Must be at least 16.
    #[allow(dead_code)]
    pub fn buffer_size(mut self, amount: usize) -> Self {
        self.buffer_size = Some(amount);
        self
    }

    /// Validates and constructs the config.
    pub fn build(self) -> Result<BufferedDatabaseConfig, BuildError> {
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size < MIN_BUFFER_SIZE {
            return Err(BuildError::InvalidParameter {
                param_name: "buffer_size",
                reason: format!("must be at least {MIN_BUFFER_SIZE}"),
            });
        }
        Ok(BufferedDatabaseConfig { buffer_size })
    }
}
