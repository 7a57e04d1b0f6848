use core::fmt;

pub type Result<T> = core::result::Result<T, ConfigError>;

/// Why a configuration was refused. A refused request changes no state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// No vNIC has this id.
    UnknownVnic(u8),
    /// The vNIC has fewer queues.
    QueueOutOfRange { vid: u8, queue: u8 },
    /// Log2 ring size outside the supported range.
    RingSize(u8),
    /// Ring base not aligned to `RING_BASE_ALIGN`.
    RingAlignment(u64),
    /// A tunable violates a sizing rule.
    Tunable(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownVnic(vid) => write!(f, "unknown vNIC {}", vid),
            ConfigError::QueueOutOfRange { vid, queue } => {
                write!(f, "queue {} out of range for vNIC {}", queue, vid)
            }
            ConfigError::RingSize(log2) => write!(f, "unsupported ring size 2^{}", log2),
            ConfigError::RingAlignment(base) => write!(f, "ring base {:#x} misaligned", base),
            ConfigError::Tunable(what) => write!(f, "invalid tunable: {}", what),
        }
    }
}
