//! Load-time and execution-time errors.

use std::io;

use thiserror::Error;

/// Errors raised while loading a program image. No partial state survives them.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Missing magic, truncated header or section, misaligned `.text`.
    #[error("{file}: invalid bytecode file: {reason}")]
    Malformed {
        /// File name used for diagnostics.
        file: String,
        /// What was wrong.
        reason: String,
    },

    /// Version mismatch, not relaxed.
    #[error("{file}: unsupported bytecode version {major}.{minor}")]
    UnsupportedVersion {
        /// File name used for diagnostics.
        file: String,
        /// Major version found.
        major: u8,
        /// Minor version found.
        minor: u8,
    },

    /// Host memory exhausted while sizing program, pool or stack buffers.
    #[error("failed to allocate {bytes} bytes")]
    Alloc {
        /// Requested size.
        bytes: usize,
    },

    /// Reading the image failed.
    #[error("{file}: {source}")]
    Io {
        /// File name used for diagnostics.
        file: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Fatal execution errors. Execution never continues after one of these.
#[derive(Debug, Error)]
pub enum VmError {
    /// Every pool slot is live.
    #[error("object pool exhausted ({capacity} elements)")]
    PoolExhausted {
        /// Pool capacity.
        capacity: u32,
    },

    /// Pop or exchange below the bottom of the stack.
    #[error("stack underflow")]
    StackUnderflow,

    /// Unknown primary opcode.
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),

    /// Unknown extended opcode.
    #[error("invalid extended opcode 0x{0:02x}")]
    InvalidExtendedOpcode(u8),

    /// Application of something that is not a function, or an operand tag
    /// that is not a builtin.
    #[error("invalid function 0x{0:02x}")]
    InvalidCombinator(u8),

    /// A pool element or stack segment was used after release.
    #[error("stale {kind} handle #{index}")]
    InvalidHandle {
        /// `"pool element"` or `"stack segment"`.
        kind: &'static str,
        /// Slot index.
        index: u32,
    },

    /// Jump target or constant offset out of range.
    #[error("address 0x{addr:08x} out of {section}")]
    InvalidAddress {
        /// `".text"` or `".rodata"`.
        section: &'static str,
        /// Offending address.
        addr: u32,
    },

    /// A stack segment could not be allocated.
    #[error("failed to allocate {bytes} bytes")]
    Alloc {
        /// Requested size.
        bytes: usize,
    },

    /// The output stream failed.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Load result.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Execution result.
pub type VmResult<T> = std::result::Result<T, VmError>;
