//! Buffers that the host allocates inside the domain.

use core::fmt::Debug;

use bytemuck::Pod;
use tracing::{trace, warn};

use super::{Sandbox, Tainted, TaintedPtr, Value};
use crate::{guest::abi::Export, CodecError, Result};

/// `count` elements of `T` in domain memory, freed through the domain's own
/// `free` when dropped.
///
/// Nothing here aliases host memory. Data moves in and out only through
/// [`copy_in`](Self::copy_in) and [`copy_out`](Self::copy_out), and the
/// domain may change the contents at any time it runs, so every copy out is a
/// verification.
pub struct ForeignBuffer<'s, T: Pod> {
  sandbox: &'s Sandbox,
  ptr: TaintedPtr<T>,
  count: usize,
}
impl<T: Pod> Debug for ForeignBuffer<'_, T> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ForeignBuffer").field("count", &self.count).finish_non_exhaustive()
  }
}

impl<'s, T: Pod> ForeignBuffer<'s, T> {
  pub(super) fn allocate(sandbox: &'s Sandbox, count: usize) -> Result<Self> {
    let bytes = u32::try_from(count)
      .ok()
      .and_then(|c| c.checked_mul(core::mem::size_of::<T>() as u32))
      .ok_or_else(|| CodecError::Resource(format!("{count} elements don't fit in the domain")))?;
    let ret = sandbox.invoke(Export::Malloc, &[Value(bytes)])?;
    let addr = ret.copy_and_verify(|addr| {
      if addr == 0 {
        return Err(CodecError::Resource(format!("domain malloc({bytes}) returned null")));
      }
      // the returned block must really be `bytes` long and in bounds
      if sandbox.memory().read(addr, bytes).is_err() {
        return Err(CodecError::Verification(format!("malloc result {addr:#x} out of bounds")));
      }
      Ok(addr)
    })?;
    sandbox.note_buffer_allocated();
    trace!(addr, bytes, "foreign buffer allocated");
    Ok(Self { sandbox, ptr: TaintedPtr::from_addr(addr), count })
  }

  /// The buffer's address, still untrusted from the domain's point of view.
  #[inline]
  #[must_use]
  pub fn ptr(&self) -> &TaintedPtr<T> {
    &self.ptr
  }

  /// The address as a call argument.
  #[inline]
  #[must_use]
  pub fn arg(&self) -> Value {
    self.ptr.arg()
  }

  /// Element count.
  #[inline]
  #[must_use]
  pub fn len(&self) -> usize {
    self.count
  }

  #[inline]
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  /// Copies `values` into the front of the buffer.
  pub fn copy_in(&self, values: &[T]) -> Result<()> {
    if values.len() > self.count {
      return Err(CodecError::Resource(format!(
        "{} elements don't fit a buffer of {}",
        values.len(),
        self.count
      )));
    }
    self.ptr.write_slice(self.sandbox, values)
  }

  /// Copies the whole buffer out.
  pub fn copy_out(&self, reason: &'static str) -> Result<Vec<T>> {
    self.ptr.copy_and_verify_slice(self.sandbox, self.count, reason)
  }

  /// Loads the first element, for buffers used as out-parameters.
  pub fn read_first(&self) -> Result<Tainted<T>> {
    self.ptr.read(self.sandbox)
  }
}

impl<T: Pod> Drop for ForeignBuffer<'_, T> {
  fn drop(&mut self) {
    match self.sandbox.invoke(Export::Free, &[self.ptr.arg()]) {
      Ok(_) => {
        self.sandbox.note_buffer_freed();
        trace!(addr = self.ptr.addr(), "foreign buffer freed");
      }
      Err(e) => warn!(addr = self.ptr.addr(), "foreign buffer release failed: {e}"),
    }
  }
}
