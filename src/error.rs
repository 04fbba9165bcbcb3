use thiserror::Error;

pub type Result<T, E = CodecError> = core::result::Result<T, E>;

/// A fault raised while executing inside the isolation domain.
///
/// Traps are never recovered from inside the domain: the call that trapped is
/// abandoned and the fault is handed back to the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Trap {
  /// Memory access outside the active linear memory.
  #[error("out of bounds memory access at {addr:#x} (+{len})")]
  OutOfBounds { addr: u32, len: u32 },

  /// The domain heap could not satisfy an allocation.
  #[error("domain heap exhausted ({requested} bytes requested)")]
  OutOfMemory { requested: u32 },

  /// `free` was given an address that isn't a live allocation.
  #[error("free of unknown address {0:#x}")]
  InvalidFree(u32),

  /// An export was called with the wrong number of arguments.
  #[error("`{export}` takes {expected} arguments, got {got}")]
  Signature { export: &'static str, expected: usize, got: usize },

  /// A struct handle that the domain never handed out (or already destroyed).
  #[error("unknown handle {0:#x}")]
  UnknownHandle(u32),

  /// An indirect call through a callback slot that holds no function.
  #[error("call through empty callback slot {0}")]
  UnknownCallback(u32),

  /// A callback (or a codec entry point) was re-entered while still running.
  #[error("re-entrant call into {0}")]
  Reentrant(&'static str),

  /// The host side of a callback failed.
  #[error("host callback failed: {0}")]
  HostCallback(String),
}

/// An error from loading or saving a PNG through the isolation domain.
#[derive(Error, Debug)]
pub enum CodecError {
  /// The isolation domain could not be created.
  #[error("isolation domain failed to initialize: {0}")]
  DomainInit(String),

  /// A short read or short write. The domain has already been told to abort.
  #[error("{0}")]
  Stream(String),

  /// Unsupported or malformed image data.
  #[error("{0}")]
  Format(String),

  /// The host could not provide a pixel buffer.
  #[error("{0}")]
  Resource(String),

  /// The domain faulted.
  #[error("domain trap: {0}")]
  Trap(#[from] Trap),

  /// A tainted value failed its verification check.
  #[error("untrusted value rejected: {0}")]
  Verification(String),

  /// An app pointer token that isn't registered (or has the wrong type).
  #[error("stale app pointer token {0:#x}")]
  StaleAppPointer(u32),

  /// Opening or flushing the file failed.
  #[error(transparent)]
  Io(#[from] std::io::Error),
}
