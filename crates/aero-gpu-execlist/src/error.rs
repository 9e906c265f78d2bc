use thiserror::Error;

/// Errors returned by the per-context command ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// Not enough free bytes; the caller should retire completed work and retry.
    #[error("ring out of space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: u32, available: u32 },

    #[error("reservation of {requested} bytes can never fit in a ring of {size} bytes")]
    TooLarge { requested: u32, size: u32 },

    #[error("reservation length {len} is not a multiple of 8 bytes")]
    Misaligned { len: u32 },

    #[error("ring size {0} must be a power of two of at least two cachelines")]
    InvalidSize(u32),

    #[error("tail offset 0x{tail:x} is not qword aligned or lies outside a ring of {size} bytes")]
    InvalidTail { tail: u32, size: u32 },

    #[error("tail offset 0x{tail:x} shares a cacheline with head 0x{head:x} but is behind it")]
    TailBehindHead { tail: u32, head: u32 },
}

/// Errors returned when validating an [`crate::ExeclistConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("num_ports={found} (expected 1..={max})")]
    BadPortCount { found: usize, max: usize },

    #[error("csb_entries={found} (expected 1..={max})")]
    BadCsbEntries { found: u8, max: u8 },

    #[error("{found} engines configured (expected 1..={max})")]
    BadEngineCount { found: usize, max: usize },

    #[error(transparent)]
    BadRingSize(#[from] RingError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExeclistError {
    #[error(transparent)]
    Ring(#[from] RingError),

    /// The engine (or the whole device) suffered an unrecoverable fault. All work was cancelled.
    #[error("device is wedged")]
    DeviceWedged,

    #[error(
        "unexpected context status entry {index}: status=0x{status:08x} context_id=0x{context_id:08x}"
    )]
    UnexpectedStatusCode {
        index: u8,
        status: u32,
        context_id: u32,
    },

    /// The hardware never acknowledged an outstanding preemption request.
    #[error("preemption not acknowledged after {elapsed_ns}ns")]
    PreemptionTimeout { elapsed_ns: u64 },

    #[error("no engine with index {0}")]
    UnknownEngine(usize),

    #[error("request belongs to engine {found}, not engine {expected}")]
    WrongEngine { expected: usize, found: usize },

    #[error("context 0x{0:x} has no ring on this engine")]
    UnknownContext(u32),

    #[error("context id 0x{0:x} is reserved for the preempt context")]
    ReservedContext(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl ExeclistError {
    /// Hardware-fault class errors must be escalated to whoever can declare the device wedged.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExeclistError::DeviceWedged | ExeclistError::PreemptionTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ExeclistError>;
