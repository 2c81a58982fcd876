//! The single error type shared by every component.
//!
//! Every variant below corresponds to one row of the error-kind table: no
//! error, and no host panic, is ever allowed to propagate across the FFI
//! boundary into native code (the dispatch stub in [`crate::detour`] catches
//! panics from host callbacks and turns them into [`Error::HostCallbackFailed`]).

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("module not found: {0}")]
    ModuleNotFound(PathBuf),

    #[error("signature pattern is malformed: {0}")]
    SignatureMalformed(String),

    #[error("parameter signature is malformed: {0}")]
    ParameterSignatureMalformed(String),

    #[error("expected {expected} arguments, got {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },

    #[error("argument at position {position} does not fit in tag '{tag}'")]
    ArgumentOutOfRange { position: usize, tag: char },

    #[error("null dereference through a Pointer with address 0")]
    NullDereference,

    #[error("text of length {needed} does not fit in a buffer of capacity {capacity}")]
    CapacityExceeded { needed: usize, capacity: usize },

    #[error("dealloc() called on a non-owning or already-released Pointer")]
    InvalidOwnership,

    #[error("cannot relocate a safe prologue at the target address: {0}")]
    UnsupportedPrologue(String),

    #[error("the OS refused to map executable memory")]
    ExecutableAllocationFailed,

    #[error("call_trampoline() on a function that has no active detour")]
    NotHooked,

    #[error("a hook callback failed: {0}")]
    HostCallbackFailed(String),

    #[error("the requested calling convention is not supported on this target")]
    UnsupportedConvention,

    #[error("requested address is the same for target and detour")]
    SameAddress,

    #[error("failed to load symbols from the OS loader: {0}")]
    Os(String),
}
