//! Engine configuration.
//!
//! All knobs are plain values validated once at engine construction; nothing
//! here is consulted on a hot path after startup.

use std::fmt;

use crate::error::ConfigError;

/// Handles staged per backend before a forced submission.
pub const SUBMIT_BATCH_SIZE: usize = 32;

/// Hard ceiling on blocks per physical transfer (iovec slots per handle).
pub const MAX_IO_COMBINE: usize = 128;

/// Which submission backend the engine binds at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IoMethodKind {
    /// Execute every operation inline at submission time.
    #[default]
    Sync,
    /// Offload to a pool of worker threads.
    Worker,
    /// Linux io_uring, one ring per backend.
    #[cfg(target_os = "linux")]
    IoUring,
    /// POSIX AIO; single-segment operations only, the rest run inline.
    PosixAio,
}

impl fmt::Display for IoMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sync => "sync",
            Self::Worker => "worker",
            #[cfg(target_os = "linux")]
            Self::IoUring => "io_uring",
            Self::PosixAio => "posix_aio",
        };
        f.write_str(name)
    }
}

/// Bit set selecting which I/O classes bypass the kernel page cache.
///
/// Direct I/O on the data class makes prefetch advice useless, which in turn
/// pins the read stream to its sequential regime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirectIoFlags {
    bits: u8,
}

impl DirectIoFlags {
    pub const NONE: Self = Self { bits: 0 };
    pub const DATA: Self = Self { bits: 1 };
    pub const WAL: Self = Self { bits: 2 };
    pub const META: Self = Self { bits: 4 };

    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }
}

/// Engine-wide configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub io_method: IoMethodKind,
    /// Number of backend threads that will register with the engine.
    pub num_backends: u32,
    /// I/O handles per backend.
    pub io_max_concurrency: u32,
    /// Size of the shared bounce-buffer pool.
    pub io_bounce_buffers: u32,
    /// Worker threads for [`IoMethodKind::Worker`].
    pub io_worker_threads: u32,
    /// Maximum blocks per physical transfer; sizes the per-handle iovec
    /// slice and caps read-stream coalescing.
    pub buffer_io_size: u32,
    /// Assumed concurrent I/Os for ordinary read streams.
    pub effective_io_concurrency: u32,
    /// Assumed concurrent I/Os for maintenance read streams.
    pub maintenance_io_concurrency: u32,
    pub direct_io: DirectIoFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_method: IoMethodKind::Sync,
            num_backends: 1,
            io_max_concurrency: 32,
            io_bounce_buffers: 256,
            io_worker_threads: 3,
            buffer_io_size: 16,
            effective_io_concurrency: 16,
            maintenance_io_concurrency: 10,
            direct_io: DirectIoFlags::NONE,
        }
    }
}

impl EngineConfig {
    /// Total handle slots across all backends.
    pub fn total_handles(&self) -> usize {
        self.num_backends as usize * self.io_max_concurrency as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_backends == 0 {
            return Err(ConfigError::Zero("num_backends"));
        }
        if self.io_max_concurrency == 0 {
            return Err(ConfigError::Zero("io_max_concurrency"));
        }
        if self.buffer_io_size == 0 {
            return Err(ConfigError::Zero("buffer_io_size"));
        }
        if self.buffer_io_size as usize > MAX_IO_COMBINE {
            return Err(ConfigError::TooLarge {
                name: "buffer_io_size",
                value: self.buffer_io_size as u64,
                max: MAX_IO_COMBINE as u64,
            });
        }
        if self.io_method == IoMethodKind::Worker && self.io_worker_threads == 0 {
            return Err(ConfigError::Zero("io_worker_threads"));
        }
        Ok(())
    }

    /// Whether read streams may issue prefetch advice at all.
    pub fn advice_capable(&self) -> bool {
        !self.direct_io.contains(DirectIoFlags::DATA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn oversized_combine_limit_rejected() {
        let config = EngineConfig {
            buffer_io_size: MAX_IO_COMBINE as u32 + 1,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn direct_data_io_disables_advice() {
        let config = EngineConfig {
            direct_io: DirectIoFlags::DATA.union(DirectIoFlags::WAL),
            ..EngineConfig::default()
        };
        assert!(!config.advice_capable());
        assert!(config.direct_io.contains(DirectIoFlags::WAL));
        assert!(!config.direct_io.contains(DirectIoFlags::META));
    }
}
