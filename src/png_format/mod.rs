//! The PNG file format, driven through the isolation domain.
//!
//! [`PngFormat`] owns the [`Sandbox`] the codec runs in. Loading and saving
//! each register their callbacks and app pointers, create a codec struct, make
//! many boundary calls, and then release everything they acquired in reverse
//! order, whether they succeeded or not.

use core::cell::RefCell;
use std::io::{Read, Write};

use tracing::{debug, warn};

use crate::{
  guest::abi::{Export, LIBPNG_VER_STRING},
  sandbox::{DomainConfig, ForeignBuffer, Tainted, Value},
  CodecError, EncodeOptions, FileOp, FormatFlags, Result, Sandbox,
};

mod color;
mod decode;
mod encode;

/// The PNG format, with the codec confined to its own domain.
#[derive(Debug)]
pub struct PngFormat {
  sandbox: Sandbox,
}
impl PngFormat {
  /// Creates the domain the codec will run in for this format's lifetime.
  pub fn create(config: DomainConfig) -> Result<Self> {
    Ok(Self { sandbox: Sandbox::create(config)? })
  }

  /// Tears the domain down.
  #[inline]
  pub fn destroy(self) {
    self.sandbox.destroy()
  }

  #[inline]
  #[must_use]
  pub const fn name(&self) -> &'static str {
    "png"
  }

  #[inline]
  #[must_use]
  pub const fn extensions(&self) -> &'static str {
    "png"
  }

  #[inline]
  #[must_use]
  pub fn flags(&self) -> FormatFlags {
    FormatFlags::LOAD
      | FormatFlags::SAVE
      | FormatFlags::RGB
      | FormatFlags::RGBA
      | FormatFlags::GRAY
      | FormatFlags::GRAYA
      | FormatFlags::INDEXED
      | FormatFlags::SEQUENCES
      | FormatFlags::PALETTE_WITH_ALPHA
  }

  /// The domain, for auditing with [`Sandbox::stats`].
  #[inline]
  #[must_use]
  pub fn sandbox(&self) -> &Sandbox {
    &self.sandbox
  }

  /// Loads the file into `fop`. On failure the reason is given to
  /// [`FileOp::set_error`].
  pub fn on_load(&self, fop: &mut dyn FileOp) -> bool {
    self.report(fop, "load", |sb, fop| decode::load(sb, fop))
  }

  /// Saves the document in `fop`. On failure the reason is given to
  /// [`FileOp::set_error`].
  pub fn on_save(&self, fop: &mut dyn FileOp, options: &EncodeOptions) -> bool {
    self.report(fop, "save", |sb, fop| encode::save(sb, fop, options))
  }

  /// Like [`on_load`](Self::on_load), with the error returned.
  pub fn load(&self, fop: &mut dyn FileOp) -> Result<()> {
    decode::load(&self.sandbox, fop)
  }

  /// Like [`on_save`](Self::on_save), with the error returned.
  pub fn save(&self, fop: &mut dyn FileOp, options: &EncodeOptions) -> Result<()> {
    encode::save(&self.sandbox, fop, options)
  }

  fn report(
    &self, fop: &mut dyn FileOp, what: &str,
    f: impl FnOnce(&Sandbox, &mut dyn FileOp) -> Result<()>,
  ) -> bool {
    match f(&self.sandbox, fop) {
      Ok(()) => true,
      Err(e) => {
        debug!(file = %fop.filename().display(), "png {what} failed: {e}");
        fop.set_error(&e.to_string());
        false
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StructKind {
  Read,
  Write,
}

/// A codec struct plus its info struct, destroyed on drop.
struct StructGuard<'s> {
  sb: &'s Sandbox,
  kind: StructKind,
  png: Tainted<u32>,
  info: Option<Tainted<u32>>,
}
impl<'s> StructGuard<'s> {
  fn create(sb: &'s Sandbox, kind: StructKind) -> Result<Self> {
    let version = copy_c_str(sb, LIBPNG_VER_STRING)?;
    let export = match kind {
      StructKind::Read => Export::CreateReadStruct,
      StructKind::Write => Export::CreateWriteStruct,
    };
    let png = sb.invoke(export, &[version.arg()])?;
    drop(version);
    if png.is_zero() {
      return Err(CodecError::Format(format!("{} failed", export.name())));
    }
    let mut guard = Self { sb, kind, png, info: None };
    let info = sb.invoke(Export::CreateInfoStruct, &[guard.png()])?;
    if info.is_zero() {
      return Err(CodecError::Format("png_create_info_struct failed".into()));
    }
    guard.info = Some(info);
    Ok(guard)
  }

  #[inline]
  fn png(&self) -> Value {
    self.png.arg()
  }

  #[inline]
  fn info(&self) -> Value {
    self.info.as_ref().map_or(Value::NULL, Tainted::arg)
  }

  /// Turns a status return into a result, fetching the codec's message when
  /// the status says it failed.
  fn check(&self, status: Tainted<u32>) -> Result<()> {
    if status.copy_and_verify(|s| Ok::<_, CodecError>(s == 1))? {
      return Ok(());
    }
    Err(CodecError::Format(self.error_message()?))
  }

  /// The message the struct failed with.
  fn error_message(&self) -> Result<String> {
    let max = self.sb.config().max_message_len;
    let len_out = self.sb.malloc_in_sandbox::<u32>(1)?;
    let addr = self.sb.invoke(Export::GetErrorMessage, &[self.png(), len_out.arg()])?;
    let len = len_out.read_first()?.copy_and_verify(|len| {
      if len < max {
        Ok(len)
      } else {
        Err(CodecError::Verification(format!("error message length {len}")))
      }
    })?;
    let ptr = addr.into_ptr::<u8>();
    if ptr.is_null() {
      return Ok("libpng error".into());
    }
    let bytes = ptr.copy_and_verify_slice(self.sb, len as usize, "message bytes are shown as text")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
  }
}
impl Drop for StructGuard<'_> {
  fn drop(&mut self) {
    let export = match self.kind {
      StructKind::Read => Export::DestroyReadStruct,
      StructKind::Write => Export::DestroyWriteStruct,
    };
    if let Err(e) = self.sb.invoke(export, &[self.png(), self.info()]) {
      warn!("{} failed: {e}", export.name());
    }
  }
}

/// Copies `s` into the domain with a trailing NUL.
fn copy_c_str<'s>(sb: &'s Sandbox, s: &str) -> Result<ForeignBuffer<'s, u8>> {
  let buf = sb.malloc_in_sandbox::<u8>(s.len() + 1)?;
  buf.copy_in(s.as_bytes())?;
  Ok(buf)
}

/// Accepts a codec getter's return only if it's exactly `flag`.
fn flag_set(ret: Tainted<u32>, flag: u32) -> bool {
  ret.copy_and_verify(|v| Ok::<_, CodecError>(v == flag)).unwrap_or(false)
}

/// Tells the codec that the stream failed, so the call waiting on the
/// callback unwinds with `msg`.
///
/// The message lives in a fresh domain buffer that is freed as soon as
/// `png_error` has copied it.
fn signal_stream_error(sb: &Sandbox, png: &Tainted<u32>, msg: &str) -> Result<()> {
  let msg = copy_c_str(sb, msg)?;
  sb.invoke(Export::Error, &[png.arg(), msg.arg()])?;
  Ok(())
}

/// The source a read callback pulls from, registered as the struct's I/O
/// pointer.
pub(crate) struct InputStream {
  reader: RefCell<Box<dyn Read>>,
  /// Set once a read came up short.
  failure: RefCell<Option<String>>,
}
impl InputStream {
  fn new(reader: Box<dyn Read>) -> Self {
    Self { reader: RefCell::new(reader), failure: RefCell::new(None) }
  }
}

/// The sink a write callback pushes to.
pub(crate) struct OutputStream {
  writer: RefCell<Box<dyn Write>>,
  failure: RefCell<Option<String>>,
}
impl OutputStream {
  fn new(writer: Box<dyn Write>) -> Self {
    Self { writer: RefCell::new(writer), failure: RefCell::new(None) }
  }
}

/// Replaces a codec-reported error with the stream failure that caused it.
fn stream_error(failure: &RefCell<Option<String>>, err: CodecError) -> CodecError {
  match (failure.borrow_mut().take(), err) {
    (Some(msg), CodecError::Format(_)) => CodecError::Stream(msg),
    (_, err) => err,
  }
}

/// The largest single transfer the codec has any reason to ask for: a whole
/// chunk with its length, tag and CRC.
#[inline]
fn max_transfer(config: &DomainConfig) -> u32 {
  config.max_chunk_size.saturating_add(12)
}
