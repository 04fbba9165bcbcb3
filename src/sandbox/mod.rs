//! The isolation domain.
//!
//! A [`Sandbox`] owns a private [`LinearMemory`] and one instance of the PNG
//! codec module that runs against it. The host talks to the module only with
//! `u32` scalars through [`Sandbox::invoke`], and the module talks back only
//! through callbacks registered with [`Sandbox::register_callback`]. Anything
//! that comes back across is [`Tainted`].
//!
//! All the guard types ([`ForeignBuffer`], [`CallbackHandle`],
//! [`AppPointer`]) borrow the sandbox, so [`Sandbox::destroy`] can't be called
//! while any of them is alive.

use core::{
  any::Any,
  cell::{Cell, Ref, RefCell, RefMut},
  fmt::Debug,
};
use std::rc::Rc;

use bytemuck::Pod;
use tracing::{debug, trace, warn};

use crate::{
  guest::{self, abi::Export},
  CodecError, Result, Trap,
};

mod app_ptr;
mod callback;
mod config;
mod heap;
pub mod memory;
mod tainted;

pub use app_ptr::AppPointer;
pub use callback::{CallbackHandle, HostFn};
pub use config::DomainConfig;
pub use heap::ForeignBuffer;
pub use memory::LinearMemory;
pub use tainted::{Tainted, TaintedPtr, Value};

/// Counts of host-held boundary resources, for leak auditing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundaryStats {
  /// [`ForeignBuffer`]s not yet freed.
  pub live_buffers: usize,
  /// Registered callbacks.
  pub live_callbacks: usize,
  /// Registered app pointers.
  pub live_app_pointers: usize,
  /// Allocations inside the domain heap, from either side.
  pub domain_allocations: usize,
}
impl BoundaryStats {
  /// No host-held resource is outstanding.
  #[inline]
  #[must_use]
  pub const fn is_clean(&self) -> bool {
    self.live_buffers == 0 && self.live_callbacks == 0 && self.live_app_pointers == 0
  }
}

/// One instance of the codec module plus its private memory.
///
/// Not `Sync`: calls into one sandbox must be serialized.
pub struct Sandbox {
  config: DomainConfig,
  memory: RefCell<LinearMemory>,
  module: RefCell<guest::Module>,
  pub(crate) callbacks: RefCell<callback::CallbackTable>,
  pub(crate) app_ptrs: RefCell<app_ptr::AppPointerTable>,
  live_buffers: Cell<usize>,
}
impl Debug for Sandbox {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Sandbox").field("config", &self.config).field("stats", &self.stats()).finish()
  }
}

impl Sandbox {
  /// Instantiates the codec module in a fresh linear memory.
  pub fn create(config: DomainConfig) -> Result<Self> {
    let memory = LinearMemory::try_new(config.initial_pages, config.max_pages)
      .map_err(CodecError::DomainInit)?;
    if config.max_message_len == 0 || config.max_chunk_size == 0 || config.max_dimension == 0 {
      return Err(CodecError::DomainInit("limits must be nonzero".into()));
    }
    debug!(pages = config.initial_pages, max_pages = config.max_pages, "sandbox created");
    Ok(Self {
      config,
      memory: RefCell::new(memory),
      module: RefCell::new(guest::Module::default()),
      callbacks: RefCell::default(),
      app_ptrs: RefCell::default(),
      live_buffers: Cell::new(0),
    })
  }

  /// Tears the instance down. Every guard borrows the sandbox, so none can
  /// outlive this.
  pub fn destroy(self) {
    let stats = self.stats();
    if stats.domain_allocations != 0 {
      debug!(allocations = stats.domain_allocations, "domain heap not empty at teardown");
    }
    debug!(pages = self.memory.borrow().page_count(), "sandbox destroyed");
  }

  #[inline]
  #[must_use]
  pub fn config(&self) -> &DomainConfig {
    &self.config
  }

  /// Resource counts right now.
  #[must_use]
  pub fn stats(&self) -> BoundaryStats {
    BoundaryStats {
      live_buffers: self.live_buffers.get(),
      live_callbacks: self.callbacks.borrow().live(),
      live_app_pointers: self.app_ptrs.borrow().live(),
      domain_allocations: self.memory.borrow().live_allocations(),
    }
  }

  /// Calls an export. The result is untrusted no matter what it is.
  pub fn invoke(&self, export: Export, args: &[Value]) -> Result<Tainted<u32>> {
    if args.len() != export.arity() {
      let (expected, got) = (export.arity(), args.len());
      return Err(Trap::Signature { export: export.name(), expected, got }.into());
    }
    let mut raw = [0_u32; 10];
    for (r, a) in raw.iter_mut().zip(args) {
      *r = a.0;
    }
    trace!(export = export.name(), "invoke");
    let ret = guest::call(self, export, &raw[..args.len()])?;
    Ok(Tainted::new(ret))
  }

  /// Allocates `count` elements of `T` in domain memory.
  pub fn malloc_in_sandbox<T: Pod>(&self, count: usize) -> Result<ForeignBuffer<'_, T>> {
    ForeignBuffer::allocate(self, count)
  }

  /// Makes `f` callable from inside the domain.
  pub fn register_callback<F>(&self, f: F) -> CallbackHandle<'_>
  where
    F: FnMut(&Sandbox, &[Tainted<u32>]) -> Result<u32> + 'static,
  {
    let value = self.callbacks.borrow_mut().register(Box::new(f));
    CallbackHandle::new(self, value)
  }

  /// Registers a host object and gets the token the domain will see.
  pub fn get_app_pointer<T: 'static>(&self, obj: Rc<T>) -> AppPointer<'_, T> {
    let obj: Rc<dyn Any> = obj;
    let token = self.app_ptrs.borrow_mut().insert(obj);
    AppPointer::new(self, token)
  }

  /// Finds the object behind a token that came back from the domain.
  ///
  /// Unknown tokens and tokens of another type are both errors.
  pub fn lookup_app_ptr<T: 'static>(&self, token: &Tainted<u32>) -> Result<Rc<T>> {
    token.clone().copy_and_verify(|t| {
      let obj = self.app_ptrs.borrow().get(t).ok_or(CodecError::StaleAppPointer(t))?;
      obj.downcast::<T>().map_err(|_| CodecError::StaleAppPointer(t))
    })
  }

  #[inline]
  pub(crate) fn memory(&self) -> Ref<'_, LinearMemory> {
    self.memory.borrow()
  }

  #[inline]
  pub(crate) fn memory_mut(&self) -> RefMut<'_, LinearMemory> {
    self.memory.borrow_mut()
  }

  #[inline]
  pub(crate) fn module_mut(&self) -> RefMut<'_, guest::Module> {
    self.module.borrow_mut()
  }

  /// An indirect call from the domain to the host.
  ///
  /// The slot's function is moved out while it runs, so the callback itself
  /// can call back into the domain. Calling the same slot again from inside
  /// traps.
  pub(crate) fn call_import(&self, slot: u32, args: &[u32]) -> Result<u32, Trap> {
    let mut f = self.callbacks.borrow_mut().take(slot)?;
    let tainted: Vec<Tainted<u32>> = args.iter().map(|&a| Tainted::new(a)).collect();
    let ret = f(self, &tainted);
    self.callbacks.borrow_mut().put_back(slot, f);
    ret.map_err(|e| {
      warn!(slot, "host callback failed: {e}");
      Trap::HostCallback(e.to_string())
    })
  }

  pub(crate) fn note_buffer_allocated(&self) {
    self.live_buffers.set(self.live_buffers.get() + 1);
  }

  pub(crate) fn note_buffer_freed(&self) {
    self.live_buffers.set(self.live_buffers.get().saturating_sub(1));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sandbox() -> Sandbox {
    Sandbox::create(DomainConfig::default()).unwrap()
  }

  #[test]
  fn test_create_rejects_bad_limits() {
    let bad = DomainConfig { initial_pages: 0, ..DomainConfig::default() };
    assert!(matches!(Sandbox::create(bad), Err(CodecError::DomainInit(_))));
    let bad = DomainConfig { max_pages: 100_000, ..DomainConfig::default() };
    assert!(matches!(Sandbox::create(bad), Err(CodecError::DomainInit(_))));
    let bad = DomainConfig { max_message_len: 0, ..DomainConfig::default() };
    assert!(matches!(Sandbox::create(bad), Err(CodecError::DomainInit(_))));
  }

  #[test]
  fn test_scalar_values_keep_their_bits() {
    assert_eq!(Value::from(-1_i32).0, u32::MAX);
    assert_eq!(Value::from(i32::MIN).0, 0x8000_0000);
    assert_eq!(Value::from(45455_i32).0, 45455);
    assert_eq!(Value::from(true).0, 1);
    assert_eq!(Value::from(false), Value::NULL);
  }

  #[test]
  fn test_arity_mismatch_traps() {
    let sb = sandbox();
    let err = sb.invoke(Export::Malloc, &[]).unwrap_err();
    assert!(matches!(err, CodecError::Trap(Trap::Signature { export: "malloc", expected: 1, got: 0 })));
  }

  #[test]
  fn test_foreign_buffer_round_trip_and_release() {
    let sb = sandbox();
    {
      let buf = sb.malloc_in_sandbox::<u16>(4).unwrap();
      buf.copy_in(&[1, 2, 3]).unwrap();
      assert_eq!(buf.copy_out("test").unwrap(), vec![1, 2, 3, 0]);
      assert!(buf.copy_in(&[0; 5]).is_err());
      assert_eq!(sb.stats().live_buffers, 1);
      assert_eq!(sb.stats().domain_allocations, 1);
    }
    assert_eq!(sb.stats(), BoundaryStats::default());
    sb.destroy();
  }

  #[test]
  fn test_free_of_bogus_address_traps() {
    let sb = sandbox();
    let err = sb.invoke(Export::Free, &[Value(12345)]).unwrap_err();
    assert!(matches!(err, CodecError::Trap(Trap::InvalidFree(12345))));
  }

  #[test]
  fn test_app_pointer_lookup() {
    let sb = sandbox();
    let obj = Rc::new(String::from("hello"));
    let p = sb.get_app_pointer(obj.clone());
    let token = Tainted::new(p.arg().0);
    assert_eq!(*sb.lookup_app_ptr::<String>(&token).unwrap(), "hello");
    assert!(matches!(sb.lookup_app_ptr::<u32>(&token), Err(CodecError::StaleAppPointer(_))));
    p.unregister();
    assert!(matches!(sb.lookup_app_ptr::<String>(&token), Err(CodecError::StaleAppPointer(_))));
    assert_eq!(sb.stats().live_app_pointers, 0);
  }

  #[test]
  fn test_callback_handle_unregisters() {
    let sb = sandbox();
    let h = sb.register_callback(|_, args| Ok(args.len() as u32));
    assert_eq!(sb.call_import(h.arg().0, &[1, 2]), Ok(2));
    assert_eq!(sb.stats().live_callbacks, 1);
    let slot = h.arg().0;
    h.unregister();
    assert_eq!(sb.call_import(slot, &[]), Err(Trap::UnknownCallback(slot)));
    assert_eq!(sb.stats().live_callbacks, 0);
  }

  #[test]
  fn test_callback_reentry_traps() {
    let sb = sandbox();
    let h = sb.register_callback(|sb, args| {
      let me = args[0].clone().unverified_safe_because("slot number used only for the call");
      match sb.call_import(me, &[me]) {
        Err(Trap::Reentrant(_)) => Ok(7),
        _ => Ok(0),
      }
    });
    let slot = h.arg().0;
    assert_eq!(sb.call_import(slot, &[slot]), Ok(7));
  }
}
