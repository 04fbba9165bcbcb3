//! The PNG codec module that runs inside the isolation domain.
//!
//! This is the only code that ever parses PNG bytes. It is written against the
//! domain's [`LinearMemory`](crate::sandbox::LinearMemory) exactly the way a
//! compiled C library would be: every argument is a `u32`, every buffer is an
//! address, and the host is reached only through callback slots. It trusts
//! nothing that lives in memory, since the host can write there too.
//!
//! Failures come in two kinds. A [`Trap`] is a fault (bad address, bad
//! handle) and aborts the call. A codec error is the `png_error` path: the
//! current operation unwinds to its export, the struct is marked failed, the
//! message is placed in memory for `png_get_error_message`, and the export
//! returns status 0.
//!
//! Only what crosses the boundary lives in linear memory: structs, published
//! getter results, stored messages and scratch blocks for callbacks. The
//! codec's working state (collected IDAT data, the inflated image, the
//! scanlines waiting to be deflated) is kept in host-heap `Vec`s owned by
//! the handle. Its size is still bounded by
//! [`DomainConfig::memory_budget`](crate::sandbox::DomainConfig::memory_budget)
//! and the chunk and dimension limits, but it isn't isolated by the domain.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::{sandbox::DomainConfig, Sandbox, Trap};

pub mod abi;
pub(crate) mod chunk;
pub(crate) mod header;
pub(crate) mod info;
pub(crate) mod read;
pub(crate) mod unfilter;
pub(crate) mod write;

use abi::{Export, UnknownChunkRaw, LIBPNG_VER_STRING};
use info::{Info, UnknownChunk};
use read::{ReadState, Transforms};
use write::WriteState;

/// How a codec operation stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Unwind {
  Trap(Trap),
  Error(String),
}
impl From<Trap> for Unwind {
  #[inline]
  fn from(t: Trap) -> Self {
    Self::Trap(t)
  }
}

pub(crate) type GResult<T> = Result<T, Unwind>;

/// Builds the `png_error` unwind.
#[inline]
pub(crate) fn png_error(msg: impl Into<String>) -> Unwind {
  Unwind::Error(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
  Read,
  Write,
}

/// Blocks of memory the codec publishes through the `png_get_*` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Mirror {
  Palette,
  TransAlpha,
  TransColor,
  IccName,
  IccProfile,
}

/// Everything the codec knows about one image.
#[derive(Default)]
pub(crate) struct Codec {
  pub(crate) info: Info,
  pub(crate) transforms: Transforms,
  pub(crate) read: ReadState,
  pub(crate) write: WriteState,
  mirrors: HashMap<Mirror, u32>,
}
impl Codec {
  fn release(&mut self, sb: &Sandbox) {
    let mut memory = sb.memory_mut();
    for (_, addr) in self.mirrors.drain() {
      if let Err(e) = memory.free(addr) {
        warn!("codec mirror release failed: {e}");
      }
    }
  }
}

/// The state behind one `png_structp`.
struct Handle {
  kind: Kind,
  info: u32,
  io_ptr: u32,
  io_fn: u32,
  chunk_ptr: u32,
  chunk_fn: u32,
  /// Set by `png_error` while a host callback runs.
  pending_error: Option<String>,
  /// Address and length of the message once the struct has failed.
  failure: Option<(u32, u32)>,
  /// Taken out while an export that needs it is running.
  codec: Option<Box<Codec>>,
}

/// Module globals.
#[derive(Default)]
pub(crate) struct Module {
  handles: HashMap<u32, Handle>,
}

/// What one running export sees: the sandbox and the struct it was called on.
pub(crate) struct Guest<'a> {
  sb: &'a Sandbox,
  png: u32,
}
impl Guest<'_> {
  #[inline]
  pub(crate) fn config(&self) -> &DomainConfig {
    self.sb.config()
  }

  fn handle<R>(&self, f: impl FnOnce(&mut Handle) -> R) -> Result<R, Trap> {
    let mut module = self.sb.module_mut();
    let h = module.handles.get_mut(&self.png).ok_or(Trap::UnknownHandle(self.png))?;
    Ok(f(h))
  }

  /// Stores a `u32` through an out-parameter. Null out-parameters are skipped.
  pub(crate) fn store_u32(&self, addr: u32, value: u32) -> Result<(), Trap> {
    if addr != 0 {
      self.sb.memory_mut().store(addr, value)?;
    }
    Ok(())
  }

  /// Copies bytes out of memory.
  pub(crate) fn load_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, Trap> {
    Ok(self.sb.memory().read(addr, len)?.to_vec())
  }

  pub(crate) fn load<T: bytemuck::Pod>(&self, addr: u32) -> Result<T, Trap> {
    self.sb.memory().load(addr)
  }

  pub(crate) fn load_c_str(&self, addr: u32, max: u32) -> Result<Vec<u8>, Trap> {
    self.sb.memory().read_c_str(addr, max)
  }

  pub(crate) fn write_bytes(&self, addr: u32, bytes: &[u8]) -> Result<(), Trap> {
    self.sb.memory_mut().write(addr, bytes)
  }

  /// Copies `bytes` into a fresh block published under `key`, replacing
  /// whatever was published there before.
  pub(crate) fn publish(&self, codec: &mut Codec, key: Mirror, bytes: &[u8]) -> Result<u32, Trap> {
    let mut memory = self.sb.memory_mut();
    if let Some(old) = codec.mirrors.remove(&key) {
      memory.free(old)?;
    }
    let len = u32::try_from(bytes.len()).map_err(|_| Trap::OutOfMemory { requested: u32::MAX })?;
    let addr = memory.malloc(len)?;
    memory.write(addr, bytes)?;
    codec.mirrors.insert(key, addr);
    Ok(addr)
  }

  fn take_pending_error(&self) -> GResult<()> {
    match self.handle(|h| h.pending_error.take())? {
      Some(msg) => Err(Unwind::Error(msg)),
      None => Ok(()),
    }
  }

  /// Calls a host function, then unwinds if the host called `png_error`.
  fn call_host(&self, slot: u32, args: &[u32]) -> GResult<u32> {
    let ret = self.sb.call_import(slot, args)?;
    self.take_pending_error()?;
    Ok(ret)
  }

  /// Calls `f` on a scratch block of `len` bytes, freeing the block whatever
  /// happens.
  fn with_scratch<R>(&self, len: u32, f: impl FnOnce(u32) -> GResult<R>) -> GResult<R> {
    let addr = self.sb.memory_mut().malloc(len)?;
    let ret = f(addr);
    self.sb.memory_mut().free(addr)?;
    ret
  }

  /// Pulls exactly `len` bytes through the read callback.
  pub(crate) fn read_data(&self, len: u32) -> GResult<Vec<u8>> {
    let io_fn = self.handle(|h| h.io_fn)?;
    if io_fn == 0 {
      return Err(png_error("Call to NULL read function"));
    }
    if len == 0 {
      return Ok(Vec::new());
    }
    self.with_scratch(len, |addr| {
      self.call_host(io_fn, &[self.png, addr, len])?;
      Ok(self.load_bytes(addr, len)?)
    })
  }

  /// Pushes `data` through the write callback in one call.
  pub(crate) fn write_data(&self, data: &[u8]) -> GResult<()> {
    let io_fn = self.handle(|h| h.io_fn)?;
    if io_fn == 0 {
      return Err(png_error("Call to NULL write function"));
    }
    let len = u32::try_from(data.len()).map_err(|_| png_error("Write data too large"))?;
    self.with_scratch(len, |addr| {
      self.write_bytes(addr, data)?;
      self.call_host(io_fn, &[self.png, addr, len])?;
      Ok(())
    })
  }

  /// Hands one unknown chunk to the user chunk callback, if there is one.
  pub(crate) fn deliver_unknown(&self, chunk: &UnknownChunk) -> GResult<()> {
    let chunk_fn = self.handle(|h| h.chunk_fn)?;
    if chunk_fn == 0 {
      trace!(tag = %chunk::tag_str(chunk.tag), "unknown chunk dropped, no callback");
      return Ok(());
    }
    let size = chunk.data.len() as u32;
    self.with_scratch(size, |data| {
      self.write_bytes(data, &chunk.data)?;
      let mut name = [0_u8; 8];
      name[..4].copy_from_slice(&chunk.tag);
      let raw = UnknownChunkRaw { name, data, size, location: chunk.location };
      let raw_len = core::mem::size_of::<UnknownChunkRaw>() as u32;
      self.with_scratch(raw_len, |raw_addr| {
        self.sb.memory_mut().store(raw_addr, raw)?;
        let ret = self.call_host(chunk_fn, &[self.png, raw_addr])? as i32;
        if ret < 0 {
          return Err(png_error("error in user chunk"));
        }
        Ok(())
      })
    })
  }
}

fn create_struct(sb: &Sandbox, kind: Kind, ver_ptr: u32) -> Result<u32, Trap> {
  let ours = LIBPNG_VER_STRING.split('.').take(2).collect::<Vec<_>>();
  let theirs = if ver_ptr == 0 { Vec::new() } else { sb.memory().read_c_str(ver_ptr, 32)? };
  let theirs = String::from_utf8_lossy(&theirs).into_owned();
  if theirs.split('.').take(2).collect::<Vec<_>>() != ours {
    warn!(built = %theirs, running = LIBPNG_VER_STRING, "incompatible libpng version");
    return Ok(0);
  }
  let png = sb.memory_mut().malloc(16)?;
  sb.module_mut().handles.insert(png, Handle {
    kind,
    info: 0,
    io_ptr: 0,
    io_fn: 0,
    chunk_ptr: 0,
    chunk_fn: 0,
    pending_error: None,
    failure: None,
    codec: Some(Box::default()),
  });
  debug!(png, ?kind, "png struct created");
  Ok(png)
}

fn create_info(sb: &Sandbox, png: u32) -> Result<u32, Trap> {
  if sb.module_mut().handles.get(&png).ok_or(Trap::UnknownHandle(png))?.info != 0 {
    warn!(png, "png struct already has an info struct");
    return Ok(0);
  }
  let info = sb.memory_mut().malloc(8)?;
  if let Some(h) = sb.module_mut().handles.get_mut(&png) {
    h.info = info;
  }
  Ok(info)
}

fn destroy_struct(sb: &Sandbox, kind: Kind, png: u32, info: u32) -> Result<u32, Trap> {
  if png == 0 {
    return Ok(0);
  }
  let handle = {
    let mut module = sb.module_mut();
    match module.handles.get(&png) {
      Some(h) if h.kind == kind && (info == 0 || info == h.info) => (),
      _ => return Err(Trap::UnknownHandle(png)),
    }
    module.handles.remove(&png).ok_or(Trap::UnknownHandle(png))?
  };
  if let Some(mut codec) = handle.codec {
    codec.release(sb);
  }
  let mut memory = sb.memory_mut();
  memory.free(png)?;
  if handle.info != 0 {
    memory.free(handle.info)?;
  }
  if let Some((addr, _)) = handle.failure {
    memory.free(addr)?;
  }
  debug!(png, ?kind, "png struct destroyed");
  Ok(0)
}

fn with_handle(sb: &Sandbox, png: u32, f: impl FnOnce(&mut Handle) -> u32) -> Result<u32, Trap> {
  let mut module = sb.module_mut();
  let h = module.handles.get_mut(&png).ok_or(Trap::UnknownHandle(png))?;
  Ok(f(h))
}

fn set_fns(
  sb: &Sandbox, kind: Kind, png: u32, f: impl FnOnce(&mut Handle),
) -> Result<u32, Trap> {
  with_handle(sb, png, |h| {
    if h.kind == kind {
      f(h);
    } else {
      warn!(png, "callback setter used on the wrong kind of png struct");
    }
    0
  })
}

fn record_error(sb: &Sandbox, png: u32, msg_ptr: u32) -> Result<u32, Trap> {
  let msg = if msg_ptr == 0 {
    "Undefined error".to_string()
  } else {
    let bytes = sb.memory().read_c_str(msg_ptr, sb.config().max_message_len)?;
    String::from_utf8_lossy(&bytes).into_owned()
  };
  with_handle(sb, png, |h| {
    h.pending_error.get_or_insert(msg);
    0
  })
}

fn error_message(sb: &Sandbox, png: u32, len_out: u32) -> Result<u32, Trap> {
  let (addr, len) = {
    let module = sb.module_mut();
    let h = module.handles.get(&png).ok_or(Trap::UnknownHandle(png))?;
    h.failure.unwrap_or((0, 0))
  };
  if len_out != 0 {
    sb.memory_mut().store(len_out, len)?;
  }
  Ok(addr)
}

/// Marks the struct failed and places the message in memory.
fn fail(sb: &Sandbox, png: u32, msg: String) -> Result<(), Trap> {
  debug!(png, "codec error: {msg}");
  let mut bytes = msg.into_bytes();
  bytes.truncate(sb.config().max_message_len.saturating_sub(1) as usize);
  let len = bytes.len() as u32;
  let addr = {
    let mut memory = sb.memory_mut();
    let addr = memory.malloc(len + 1)?;
    memory.write(addr, &bytes)?;
    addr
  };
  let mut module = sb.module_mut();
  match module.handles.get_mut(&png) {
    Some(h) => {
      h.pending_error = None;
      if let Some((old, _)) = h.failure.replace((addr, len)) {
        drop(module);
        sb.memory_mut().free(old)?;
      }
      Ok(())
    }
    None => {
      drop(module);
      sb.memory_mut().free(addr)
    }
  }
}

/// Checks the handles and reports whether the struct already failed.
fn enter(sb: &Sandbox, kind: Option<Kind>, png: u32, info: u32) -> Result<bool, Trap> {
  let module = sb.module_mut();
  let h = module.handles.get(&png).ok_or(Trap::UnknownHandle(png))?;
  if kind.is_some_and(|k| k != h.kind) {
    return Err(Trap::UnknownHandle(png));
  }
  if info != 0 && info != h.info {
    return Err(Trap::UnknownHandle(info));
  }
  if h.failure.is_some() {
    return Ok(true);
  }
  drop(module);
  // `png_error` called outside of any callback fails the struct right away
  let stray = sb.module_mut().handles.get_mut(&png).and_then(|h| h.pending_error.take());
  match stray {
    Some(msg) => fail(sb, png, msg).map(|()| true),
    None => Ok(false),
  }
}

/// Runs `f` with the codec moved out of its handle.
fn run<R>(sb: &Sandbox, png: u32, f: impl FnOnce(&Guest<'_>, &mut Codec) -> GResult<R>) -> GResult<R> {
  let mut codec = {
    let mut module = sb.module_mut();
    let h = module.handles.get_mut(&png).ok_or(Trap::UnknownHandle(png))?;
    h.codec.take().ok_or(Trap::Reentrant("png struct"))?
  };
  let ret = f(&Guest { sb, png }, &mut codec);
  let orphan = {
    let mut module = sb.module_mut();
    match module.handles.get_mut(&png) {
      Some(h) => {
        h.codec = Some(codec);
        None
      }
      None => Some(codec),
    }
  };
  if let Some(mut codec) = orphan {
    codec.release(sb);
  }
  ret
}

/// An export that reports success as 1 and a codec error as 0.
fn status(
  sb: &Sandbox, kind: Kind, png: u32, info: u32,
  f: impl FnOnce(&Guest<'_>, &mut Codec) -> GResult<()>,
) -> Result<u32, Trap> {
  if enter(sb, Some(kind), png, info)? {
    return Ok(0);
  }
  match run(sb, png, f) {
    Ok(()) => Ok(1),
    Err(Unwind::Trap(t)) => Err(t),
    Err(Unwind::Error(msg)) => fail(sb, png, msg).map(|()| 0),
  }
}

/// An export that returns a value. Queries on a failed struct return 0.
fn query(
  sb: &Sandbox, png: u32, info: u32, f: impl FnOnce(&Guest<'_>, &mut Codec) -> GResult<u32>,
) -> Result<u32, Trap> {
  if enter(sb, None, png, info)? {
    return Ok(0);
  }
  match run(sb, png, f) {
    Ok(v) => Ok(v),
    Err(Unwind::Trap(t)) => Err(t),
    Err(Unwind::Error(msg)) => fail(sb, png, msg).map(|()| 0),
  }
}

/// Entry point for [`Sandbox::invoke`]. The argument count is already checked.
pub(crate) fn call(sb: &Sandbox, export: Export, a: &[u32]) -> Result<u32, Trap> {
  use Kind::{Read, Write};
  match export {
    Export::Malloc => sb.memory_mut().malloc(a[0]),
    Export::Free => {
      if a[0] != 0 {
        sb.memory_mut().free(a[0])?;
      }
      Ok(0)
    }
    Export::CreateReadStruct => create_struct(sb, Read, a[0]),
    Export::CreateWriteStruct => create_struct(sb, Write, a[0]),
    Export::CreateInfoStruct => create_info(sb, a[0]),
    Export::DestroyReadStruct => destroy_struct(sb, Read, a[0], a[1]),
    Export::DestroyWriteStruct => destroy_struct(sb, Write, a[0], a[1]),
    Export::Error => record_error(sb, a[0], a[1]),
    Export::GetErrorMessage => error_message(sb, a[0], a[1]),
    Export::GetIoPtr => with_handle(sb, a[0], |h| h.io_ptr),
    Export::GetUserChunkPtr => with_handle(sb, a[0], |h| h.chunk_ptr),
    Export::SetReadFn => set_fns(sb, Read, a[0], |h| {
      h.io_ptr = a[1];
      h.io_fn = a[2];
    }),
    Export::SetWriteFn => set_fns(sb, Write, a[0], |h| {
      h.io_ptr = a[1];
      h.io_fn = a[2];
    }),
    Export::SetReadUserChunkFn => set_fns(sb, Read, a[0], |h| {
      h.chunk_ptr = a[1];
      h.chunk_fn = a[2];
    }),
    Export::ReadInfo => status(sb, Read, a[0], a[1], read::read_info),
    Export::GetIHDR => query(sb, a[0], a[1], |g, c| info::get_ihdr(g, c, &a[2..7])),
    Export::SetStrip16 => query(sb, a[0], 0, |_, c| Ok(c.transforms.set(|t| t.strip_16 = true))),
    Export::SetPacking => query(sb, a[0], 0, |_, c| Ok(c.transforms.set(|t| t.packing = true))),
    Export::SetExpandGray1248 => {
      query(sb, a[0], 0, |_, c| Ok(c.transforms.set(|t| t.expand_gray = true)))
    }
    Export::SetInterlaceHandling => query(sb, a[0], 0, |_, c| Ok(read::set_interlace_handling(c))),
    Export::ReadUpdateInfo => status(sb, Read, a[0], a[1], read::read_update_info),
    Export::GetImageWidth => query(sb, a[0], a[1], |_, c| Ok(c.info.ihdr.map_or(0, |h| h.width))),
    Export::GetImageHeight => query(sb, a[0], a[1], |_, c| Ok(c.info.ihdr.map_or(0, |h| h.height))),
    Export::GetRowbytes => query(sb, a[0], a[1], |_, c| Ok(c.rowbytes())),
    Export::GetColorType => {
      query(sb, a[0], a[1], |_, c| Ok(c.info.ihdr.map_or(0, |h| h.color_type as u32)))
    }
    Export::GetPLTE => query(sb, a[0], a[1], |g, c| info::get_plte(g, c, a[2], a[3])),
    Export::GetTRNS => query(sb, a[0], a[1], |g, c| info::get_trns(g, c, a[2], a[3], a[4])),
    Export::GetValid => query(sb, a[0], a[1], |_, c| Ok(c.info.valid() & a[2])),
    Export::GetICCP => query(sb, a[0], a[1], |g, c| info::get_iccp(g, c, &a[2..6])),
    Export::GetCHRMFixed => query(sb, a[0], a[1], |g, c| info::get_chrm(g, c, &a[2..10])),
    Export::GetGAMAFixed => query(sb, a[0], a[1], |g, c| info::get_gama(g, c, a[2])),
    Export::ReadRow => status(sb, Read, a[0], 0, |g, c| read::read_row(g, c, a[1], a[2])),
    Export::ReadEnd => status(sb, Read, a[0], a[1], read::read_end),
    Export::SetIHDR => status(sb, Write, a[0], a[1], |g, c| info::set_ihdr(g, c, &a[2..9])),
    Export::SetPLTE => status(sb, Write, a[0], a[1], |g, c| info::set_plte(g, c, a[2], a[3])),
    Export::SetTRNS => {
      status(sb, Write, a[0], a[1], |g, c| info::set_trns(g, c, a[2], a[3], a[4]))
    }
    Export::SetICCP => status(sb, Write, a[0], a[1], |g, c| info::set_iccp(g, c, &a[2..6])),
    Export::SetSRGB => status(sb, Write, a[0], a[1], |_, c| info::set_srgb(c, a[2])),
    Export::SetCHRMFixed => status(sb, Write, a[0], a[1], |_, c| info::set_chrm(c, &a[2..10])),
    Export::SetGAMAFixed => status(sb, Write, a[0], a[1], |_, c| info::set_gama(c, a[2])),
    Export::SetUnknownChunks => {
      status(sb, Write, a[0], a[1], |g, c| info::set_unknown_chunks(g, c, a[2], a[3]))
    }
    Export::WriteInfo => status(sb, Write, a[0], a[1], write::write_info),
    Export::WriteRow => status(sb, Write, a[0], 0, |g, c| write::write_row(g, c, a[1])),
    Export::WriteEnd => status(sb, Write, a[0], a[1], write::write_end),
  }
}
