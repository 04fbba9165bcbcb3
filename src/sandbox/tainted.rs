//! Values that came out of (or can be changed by) the isolation domain.
//!
//! A [`Tainted`] value can do two things: go back into the domain untouched
//! (via [`arg`](Tainted::arg)), or come out through a verification call. The
//! verification calls either run a caller-supplied check, or take a
//! `reason` string that is recorded in the trace log for auditing. There is
//! deliberately no `Deref`, no `Copy`, and no accessor for the raw value.

use core::{fmt::Debug, marker::PhantomData};

use bytemuck::Pod;
use tracing::trace;

use crate::{CodecError, Result, Sandbox};

/// A scalar argument to a domain call.
///
/// Plain host scalars convert with `From`. Tainted values, buffers, callback
/// handles and app pointers each have an `arg` method.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(pub(crate) u32);
impl Value {
  /// The null address.
  pub const NULL: Self = Self(0);
}
impl From<u32> for Value {
  #[inline]
  fn from(v: u32) -> Self {
    Self(v)
  }
}
impl From<i32> for Value {
  #[inline]
  fn from(v: i32) -> Self {
    Self(u32::from_ne_bytes(v.to_ne_bytes()))
  }
}
impl From<bool> for Value {
  #[inline]
  fn from(v: bool) -> Self {
    Self(u32::from(v))
  }
}
impl Debug for Value {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "Value({:#x})", self.0)
  }
}

/// An untrusted scalar produced by the isolation domain.
#[derive(Clone, PartialEq, Eq)]
pub struct Tainted<T> {
  value: T,
}
impl<T> Debug for Tainted<T> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.write_str("Tainted(..)")
  }
}
impl<T: Pod> Tainted<T> {
  #[inline]
  pub(crate) const fn new(value: T) -> Self {
    Self { value }
  }

  /// Runs `verifier` on the value and returns whatever it decides.
  #[inline]
  pub fn copy_and_verify<U, E>(self, verifier: impl FnOnce(T) -> Result<U, E>) -> Result<U, E> {
    verifier(self.value)
  }

  /// Takes the value without a check.
  ///
  /// Only for fixed-size scalars where every bit pattern is acceptable to the
  /// caller. The `reason` is logged.
  #[inline]
  pub fn unverified_safe_because(self, reason: &'static str) -> T {
    trace!(target: "caged_png::taint", reason, "unverified scalar released");
    self.value
  }
}
impl Tainted<u32> {
  /// Hands the value back to the domain without looking at it.
  #[inline]
  #[must_use]
  pub fn arg(&self) -> Value {
    Value(self.value)
  }

  /// Reinterprets the value as an address in domain memory.
  #[inline]
  #[must_use]
  pub fn into_ptr<T>(self) -> TaintedPtr<T> {
    TaintedPtr::from_addr(self.value)
  }

  /// Compares against zero, which is always safe to do.
  #[inline]
  #[must_use]
  pub fn is_zero(&self) -> bool {
    self.value == 0
  }
}

/// An untrusted address inside the domain's linear memory, pointing at `T`.
pub struct TaintedPtr<T> {
  addr: u32,
  _marker: PhantomData<fn() -> T>,
}
impl<T> Clone for TaintedPtr<T> {
  #[inline]
  fn clone(&self) -> Self {
    Self::from_addr(self.addr)
  }
}
impl<T> Debug for TaintedPtr<T> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.write_str("TaintedPtr(..)")
  }
}
impl<T> TaintedPtr<T> {
  #[inline]
  pub(crate) const fn from_addr(addr: u32) -> Self {
    Self { addr, _marker: PhantomData }
  }

  #[inline]
  pub(crate) const fn addr(&self) -> u32 {
    self.addr
  }

  /// Null pointers are always safe to check for.
  #[inline]
  #[must_use]
  pub const fn is_null(&self) -> bool {
    self.addr == 0
  }

  /// Hands the address back to the domain without looking at it.
  #[inline]
  #[must_use]
  pub const fn arg(&self) -> Value {
    Value(self.addr)
  }

  /// Runs `verifier` on the raw address.
  #[inline]
  pub fn copy_and_verify_address<U, E>(
    &self, verifier: impl FnOnce(u32) -> Result<U, E>,
  ) -> Result<U, E> {
    verifier(self.addr)
  }
}
impl<T: Pod> TaintedPtr<T> {
  const ELEMENT: u32 = core::mem::size_of::<T>() as u32;

  /// Pointer arithmetic in units of `T`. The result is just as untrusted.
  #[inline]
  #[must_use]
  pub fn add(&self, count: u32) -> Self {
    Self::from_addr(self.addr.wrapping_add(count.wrapping_mul(Self::ELEMENT)))
  }

  fn byte_len(count: usize) -> Result<u32> {
    u32::try_from(count)
      .ok()
      .and_then(|c| c.checked_mul(Self::ELEMENT))
      .ok_or_else(|| CodecError::Verification(format!("{count} elements can't be addressed")))
  }

  /// Loads the pointee. The loaded value is itself tainted.
  pub fn read(&self, sandbox: &Sandbox) -> Result<Tainted<T>> {
    let value = sandbox.memory().load::<T>(self.addr)?;
    Ok(Tainted::new(value))
  }

  /// Copies exactly `count` elements out of domain memory.
  ///
  /// The whole range is bounds checked before anything is copied. The `reason`
  /// explains why any bit pattern of `T` is acceptable and is logged.
  pub fn copy_and_verify_slice(
    &self, sandbox: &Sandbox, count: usize, reason: &'static str,
  ) -> Result<Vec<T>> {
    if self.is_null() && count > 0 {
      return Err(CodecError::Verification(format!("null pointer for {count} elements")));
    }
    let len = Self::byte_len(count)?;
    let memory = sandbox.memory();
    let bytes = memory.read(self.addr, len)?;
    trace!(target: "caged_png::taint", reason, len, "verified range copied out");
    Ok(bytes.chunks_exact(Self::ELEMENT as usize).map(bytemuck::pod_read_unaligned).collect())
  }

  /// Stores one element into domain memory.
  pub fn write(&self, sandbox: &Sandbox, value: T) -> Result<()> {
    sandbox.memory_mut().store(self.addr, value)?;
    Ok(())
  }

  /// Copies `values` into domain memory starting at this address.
  pub fn write_slice(&self, sandbox: &Sandbox, values: &[T]) -> Result<()> {
    sandbox.memory_mut().write(self.addr, bytemuck::cast_slice(values))?;
    Ok(())
  }
}
impl TaintedPtr<u8> {
  /// Copies out a NUL-terminated string of at most `max` bytes.
  ///
  /// Invalid UTF-8 is replaced, never trusted.
  pub fn copy_and_verify_string(
    &self, sandbox: &Sandbox, max: u32, reason: &'static str,
  ) -> Result<String> {
    if self.is_null() {
      return Err(CodecError::Verification("null string pointer".into()));
    }
    let bytes = sandbox.memory().read_c_str(self.addr, max)?;
    trace!(target: "caged_png::taint", reason, len = bytes.len(), "verified string copied out");
    Ok(String::from_utf8_lossy(&bytes).into_owned())
  }
}
