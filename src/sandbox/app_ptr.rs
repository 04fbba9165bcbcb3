//! Opaque tokens that stand in for host objects while the domain holds them.

use core::{any::Any, fmt::Debug, marker::PhantomData};
use std::{collections::HashMap, rc::Rc};

use tracing::trace;

use super::{Sandbox, Value};

#[derive(Default)]
pub(crate) struct AppPointerTable {
  next: u32,
  entries: HashMap<u32, Rc<dyn Any>>,
}
impl AppPointerTable {
  pub(crate) fn insert(&mut self, obj: Rc<dyn Any>) -> u32 {
    // tokens never collide with a live entry and are never 0
    loop {
      self.next = self.next.wrapping_add(1);
      if self.next != 0 && !self.entries.contains_key(&self.next) {
        break;
      }
    }
    self.entries.insert(self.next, obj);
    self.next
  }

  pub(crate) fn get(&self, token: u32) -> Option<Rc<dyn Any>> {
    self.entries.get(&token).cloned()
  }

  pub(crate) fn remove(&mut self, token: u32) -> bool {
    self.entries.remove(&token).is_some()
  }

  pub(crate) fn live(&self) -> usize {
    self.entries.len()
  }
}

/// A host object made visible to the domain as an opaque token.
///
/// The domain can only hand the token back; the object is found again with
/// [`Sandbox::lookup_app_ptr`]. Dropping this unregisters the token.
#[must_use = "dropping the app pointer unregisters it"]
pub struct AppPointer<'s, T: 'static> {
  sandbox: &'s Sandbox,
  token: u32,
  _marker: PhantomData<Rc<T>>,
}
impl<T> Debug for AppPointer<'_, T> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "AppPointer({:#x})", self.token)
  }
}
impl<'s, T: 'static> AppPointer<'s, T> {
  pub(super) fn new(sandbox: &'s Sandbox, token: u32) -> Self {
    trace!(token, "app pointer registered");
    Self { sandbox, token, _marker: PhantomData }
  }

  /// The token as a call argument.
  #[inline]
  #[must_use]
  pub fn arg(&self) -> Value {
    Value(self.token)
  }

  /// Unregisters now rather than at the end of the scope.
  #[inline]
  pub fn unregister(self) {
    drop(self)
  }
}
impl<T: 'static> Drop for AppPointer<'_, T> {
  fn drop(&mut self) {
    if self.sandbox.app_ptrs.borrow_mut().remove(self.token) {
      trace!(token = self.token, "app pointer unregistered");
    }
  }
}
