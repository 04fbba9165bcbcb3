//! Host functions the domain can call by slot number.

use core::fmt::Debug;

use tracing::{debug, trace};

use super::{Sandbox, Tainted, Value};
use crate::{Result, Trap};

/// The host side of a callback.
///
/// Every argument arrives tainted. The returned `u32` goes back into the
/// domain as the call's result.
pub type HostFn = Box<dyn FnMut(&Sandbox, &[Tainted<u32>]) -> Result<u32>>;

enum Slot {
  Empty,
  Ready(HostFn),
  Running,
}

/// Slot table behind the domain's indirect calls. Slot `n` is addressed by the
/// value `n + 1`, so 0 stays "no function".
#[derive(Default)]
pub(crate) struct CallbackTable {
  slots: Vec<Slot>,
}
impl CallbackTable {
  pub(crate) fn register(&mut self, f: HostFn) -> u32 {
    let index = match self.slots.iter().position(|s| matches!(s, Slot::Empty)) {
      Some(i) => {
        self.slots[i] = Slot::Ready(f);
        i
      }
      None => {
        self.slots.push(Slot::Ready(f));
        self.slots.len() - 1
      }
    };
    index as u32 + 1
  }

  pub(crate) fn unregister(&mut self, value: u32) -> bool {
    match value.checked_sub(1).and_then(|i| self.slots.get_mut(i as usize)) {
      Some(slot) if !matches!(slot, Slot::Empty) => {
        *slot = Slot::Empty;
        true
      }
      _ => false,
    }
  }

  /// Moves the function out so it can run without the table borrowed.
  pub(crate) fn take(&mut self, value: u32) -> Result<HostFn, Trap> {
    let slot = value
      .checked_sub(1)
      .and_then(|i| self.slots.get_mut(i as usize))
      .ok_or(Trap::UnknownCallback(value))?;
    match core::mem::replace(slot, Slot::Running) {
      Slot::Ready(f) => Ok(f),
      Slot::Running => Err(Trap::Reentrant("host callback")),
      Slot::Empty => {
        *slot = Slot::Empty;
        Err(Trap::UnknownCallback(value))
      }
    }
  }

  /// Returns a function after it ran. If the slot was unregistered while the
  /// function was running, the function is dropped instead.
  pub(crate) fn put_back(&mut self, value: u32, f: HostFn) {
    if let Some(slot) = value.checked_sub(1).and_then(|i| self.slots.get_mut(i as usize)) {
      if matches!(slot, Slot::Running) {
        *slot = Slot::Ready(f);
      }
    }
  }

  pub(crate) fn live(&self) -> usize {
    self.slots.iter().filter(|s| !matches!(s, Slot::Empty)).count()
  }
}

/// A registered callback. Unregisters on drop.
#[must_use = "dropping the handle unregisters the callback"]
pub struct CallbackHandle<'s> {
  sandbox: &'s Sandbox,
  value: u32,
}
impl Debug for CallbackHandle<'_> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "CallbackHandle({})", self.value)
  }
}
impl<'s> CallbackHandle<'s> {
  pub(super) fn new(sandbox: &'s Sandbox, value: u32) -> Self {
    trace!(slot = value, "callback registered");
    Self { sandbox, value }
  }

  /// The callback as a function-pointer argument.
  #[inline]
  #[must_use]
  pub fn arg(&self) -> Value {
    Value(self.value)
  }

  /// Unregisters now rather than at the end of the scope.
  #[inline]
  pub fn unregister(self) {
    drop(self)
  }
}
impl Drop for CallbackHandle<'_> {
  fn drop(&mut self) {
    if self.sandbox.callbacks.borrow_mut().unregister(self.value) {
      trace!(slot = self.value, "callback unregistered");
    } else {
      debug!(slot = self.value, "callback slot was already empty");
    }
  }
}
