//! Loading a PNG: the host side of the read pipeline.
//!
//! The codec is asked for the header, told to normalize every image to
//! byte-aligned 8-bit samples, and then read row by row (once per interlace
//! pass) into domain row buffers. Only after all rows are in are they
//! converted to the host's pixel formats.

use core::cell::RefCell;
use std::{io::Read, rc::Rc};

use tracing::{debug, trace};

use super::{
  color, flag_set, max_transfer, signal_stream_error, stream_error, InputStream, StructGuard,
  StructKind,
};
use crate::{
  guest::abi::{
    Color16Raw, Export, UnknownChunkRaw, PNG_COLOR_TYPE_GRAY, PNG_COLOR_TYPE_GRAY_ALPHA,
    PNG_COLOR_TYPE_PALETTE, PNG_COLOR_TYPE_RGB, PNG_COLOR_TYPE_RGB_ALPHA, PNG_INFO_PLTE,
    PNG_INFO_TRNS, PNG_MAX_PALETTE_LENGTH,
  },
  sandbox::{ForeignBuffer, Tainted, TaintedPtr, Value},
  ChunkPlacement, ChunkRecord, CodecError, ColorSpace, FileOp, Image, PixelFormat, PngOptions,
  Result, Sandbox, RGB8, RGBA8, YA8,
};

/// `IHDR` as reported by the codec, after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
  width: u32,
  height: u32,
  bit_depth: u32,
  color_type: u32,
  interlaced: bool,
}
impl Header {
  fn verify(values: &[u32], max_dimension: u32) -> Result<Self> {
    let &[width, height, bit_depth, color_type, interlace] = values else {
      return Err(CodecError::Verification("IHDR out-parameters".into()));
    };
    let bad = |what: &str, v: u32| Err(CodecError::Verification(format!("IHDR {what} {v}")));
    if width == 0 || width > max_dimension {
      return bad("width", width);
    }
    if height == 0 || height > max_dimension {
      return bad("height", height);
    }
    if ![1, 2, 4, 8, 16].contains(&bit_depth) {
      return bad("bit depth", bit_depth);
    }
    if interlace > 1 {
      return bad("interlace method", interlace);
    }
    Ok(Self { width, height, bit_depth, color_type, interlaced: interlace == 1 })
  }

  /// Host format, samples per pixel after normalization, and whether the
  /// image carries an alpha channel.
  fn layout(&self) -> Result<(PixelFormat, u32, bool)> {
    match self.color_type {
      PNG_COLOR_TYPE_RGB_ALPHA => Ok((PixelFormat::Rgb, 4, true)),
      PNG_COLOR_TYPE_RGB => Ok((PixelFormat::Rgb, 3, false)),
      PNG_COLOR_TYPE_GRAY_ALPHA => Ok((PixelFormat::Grayscale, 2, true)),
      PNG_COLOR_TYPE_GRAY => Ok((PixelFormat::Grayscale, 1, false)),
      PNG_COLOR_TYPE_PALETTE => Ok((PixelFormat::Indexed, 1, false)),
      _ => Err(CodecError::Format("Color type not supported".into())),
    }
  }
}

/// A color that decodes as fully transparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransColor {
  Gray(u8),
  Rgb(RGB8),
}

/// Read callback: fills `len` bytes at `data` from the input stream.
fn read_data(sb: &Sandbox, args: &[Tainted<u32>]) -> Result<u32> {
  let [png, data, len] = args else {
    return Err(CodecError::Verification(format!("read callback given {} arguments", args.len())));
  };
  let token = sb.invoke(Export::GetIoPtr, &[png.arg()])?;
  let stream = sb.lookup_app_ptr::<InputStream>(&token)?;
  let max = max_transfer(sb.config());
  let len = len.clone().copy_and_verify(|n| {
    if n <= max {
      Ok(n as usize)
    } else {
      Err(CodecError::Verification(format!("read of {n} bytes requested")))
    }
  })?;
  let mut buf = vec![0_u8; len];
  let read = stream.reader.borrow_mut().read_exact(&mut buf);
  match read {
    Ok(()) => {
      data.clone().into_ptr::<u8>().write_slice(sb, &buf)?;
      trace!(len, "read");
    }
    Err(e) => {
      let msg = format!("read error: {e}");
      debug!(len, "{msg}");
      *stream.failure.borrow_mut() = Some(msg.clone());
      signal_stream_error(sb, png, &msg)?;
    }
  }
  Ok(0)
}

/// User chunk callback: copies one unknown chunk into the document options.
fn read_user_chunk(sb: &Sandbox, args: &[Tainted<u32>]) -> Result<u32> {
  let [png, chunk] = args else {
    return Err(CodecError::Verification(format!("chunk callback given {} arguments", args.len())));
  };
  let token = sb.invoke(Export::GetUserChunkPtr, &[png.arg()])?;
  let options = sb.lookup_app_ptr::<RefCell<PngOptions>>(&token)?;
  let max = sb.config().max_chunk_size;
  let raw = chunk.clone().into_ptr::<UnknownChunkRaw>().read(sb)?.copy_and_verify(|raw| {
    if !raw.name[..4].iter().all(u8::is_ascii_alphabetic) {
      return Err(CodecError::Verification("chunk name isn't four letters".into()));
    }
    if raw.size > max {
      return Err(CodecError::Verification(format!("chunk size {}", raw.size)));
    }
    Ok(raw)
  })?;
  // the payload address is only checked by the bounded copy below
  let data = TaintedPtr::<u8>::from_addr(raw.data).copy_and_verify_slice(
    sb,
    raw.size as usize,
    "payload is opaque bytes of the verified size",
  )?;
  let name = [raw.name[0], raw.name[1], raw.name[2], raw.name[3]];
  let placement = ChunkPlacement::from_location(raw.location);
  trace!(name = %String::from_utf8_lossy(&name), len = data.len(), ?placement, "unknown chunk kept");
  options.borrow_mut().add_chunk(ChunkRecord { name, placement, data });
  Ok(1)
}

/// Loads the file named by `fop` into `fop`'s document.
pub(super) fn load(sb: &Sandbox, fop: &mut dyn FileOp) -> Result<()> {
  let stream = Rc::new(InputStream::new(fop.open_input()?));
  let options = Rc::new(RefCell::new(PngOptions::default()));

  let read_cb = sb.register_callback(read_data);
  let chunk_cb = sb.register_callback(read_user_chunk);
  let file_ptr = sb.get_app_pointer(stream.clone());
  let options_ptr = sb.get_app_pointer(options.clone());

  let st = StructGuard::create(sb, StructKind::Read)?;
  sb.invoke(Export::SetReadUserChunkFn, &[st.png(), options_ptr.arg(), chunk_cb.arg()])?;
  sb.invoke(Export::SetReadFn, &[st.png(), file_ptr.arg(), read_cb.arg()])?;

  decode(&st, fop).map_err(|e| stream_error(&stream.failure, e))?;
  drop(st);
  options_ptr.unregister();
  file_ptr.unregister();
  chunk_cb.unregister();
  read_cb.unregister();

  let options = options.take();
  if !options.is_empty() {
    fop.set_loaded_format_options(options);
  }
  Ok(())
}

fn decode(st: &StructGuard<'_>, fop: &mut dyn FileOp) -> Result<()> {
  let sb = st.sb;
  let (png, info) = (st.png(), st.info());

  st.check(sb.invoke(Export::ReadInfo, &[png, info])?)?;
  let header = read_header(st)?;
  let (format, samples, has_alpha) = header.layout()?;
  debug!(?header, "header read");

  // everything comes out as byte-aligned 8-bit samples
  sb.invoke(Export::SetStrip16, &[png])?;
  sb.invoke(Export::SetPacking, &[png])?;
  if header.color_type == PNG_COLOR_TYPE_GRAY && header.bit_depth < 8 {
    sb.invoke(Export::SetExpandGray1248, &[png])?;
  }
  let expected_passes = if header.interlaced { 7 } else { 1 };
  let passes = sb.invoke(Export::SetInterlaceHandling, &[png])?.copy_and_verify(|p| {
    if p == expected_passes {
      Ok(p)
    } else {
      Err(CodecError::Verification(format!("{p} interlace passes")))
    }
  })?;
  st.check(sb.invoke(Export::ReadUpdateInfo, &[png, info])?)?;

  let (width, height) = (header.width, header.height);
  let expected_rowbytes = width.checked_mul(samples);
  let rowbytes = sb.invoke(Export::GetRowbytes, &[png, info])?.copy_and_verify(|n| {
    if Some(n) == expected_rowbytes {
      Ok(n as usize)
    } else {
      Err(CodecError::Verification(format!("rowbytes {n} for a {width} pixel row")))
    }
  })?;

  if fop.sequence_image(format, width, height).is_none() {
    return Err(CodecError::Resource(format!("Not enough memory for a {width}x{height} image")));
  }
  if has_alpha {
    fop.sequence_set_has_alpha(true);
  }

  let trans = match header.color_type {
    PNG_COLOR_TYPE_PALETTE => {
      read_palette(st, fop)?;
      None
    }
    PNG_COLOR_TYPE_RGB | PNG_COLOR_TYPE_GRAY => read_trans_color(st, header.color_type)?,
    _ => None,
  };

  let mut rows: Vec<ForeignBuffer<'_, u8>> = Vec::new();
  rows.try_reserve_exact(height as usize).map_err(|e| CodecError::Resource(e.to_string()))?;
  for _ in 0..height {
    rows.push(sb.malloc_in_sandbox::<u8>(rowbytes)?);
  }

  let mut cancelled = false;
  'passes: for pass in 0..passes {
    for (y, row) in (0..height).zip(&rows) {
      st.check(sb.invoke(Export::ReadRow, &[png, row.arg(), Value::NULL])?)?;
      fop.set_progress((f64::from(pass) + f64::from(y + 1) / f64::from(height)) / f64::from(passes));
      if fop.is_stop() {
        debug!(pass, y, "load cancelled");
        cancelled = true;
        break 'passes;
      }
    }
  }

  let mut trans_matched = false;
  let Some(image) = fop.current_image_mut() else {
    return Err(CodecError::Resource("the image went away during the load".into()));
  };
  for (y, row) in (0..height).zip(rows) {
    let src = row.copy_out("any byte is a valid 8-bit sample")?;
    drop(row);
    trans_matched |= convert_row(image, y, header.color_type, &src, trans)?;
  }
  if trans_matched {
    fop.sequence_set_has_alpha(true);
  }

  if !cancelled {
    st.check(sb.invoke(Export::ReadEnd, &[png, info])?)?;
  }

  match color::load_color_space(st)? {
    Some(color_space) => {
      fop.set_embedded_color_profile();
      if fop.color_space().is_none() {
        fop.set_color_space(color_space);
      }
    }
    None if fop.color_space().is_none() => fop.set_color_space(ColorSpace::srgb()),
    None => (),
  }
  debug!(width, height, cancelled, "png loaded");
  Ok(())
}

fn read_header(st: &StructGuard<'_>) -> Result<Header> {
  let sb = st.sb;
  let outs = sb.malloc_in_sandbox::<u32>(5)?;
  let mut args = vec![st.png(), st.info()];
  args.extend((0..5).map(|i| outs.ptr().add(i).arg()));
  st.check(sb.invoke(Export::GetIHDR, &args)?)?;
  let values = outs.copy_out("every field is range checked next")?;
  Header::verify(&values, sb.config().max_dimension)
}

/// Copies the palette and its alphas into the document. The first fully
/// transparent entry becomes the mask color.
fn read_palette(st: &StructGuard<'_>, fop: &mut dyn FileOp) -> Result<()> {
  let sb = st.sb;
  let (png, info) = (st.png(), st.info());

  let outs = sb.malloc_in_sandbox::<u32>(2)?;
  let ret = sb.invoke(Export::GetPLTE, &[png, info, outs.ptr().arg(), outs.ptr().add(1).arg()])?;
  if !flag_set(ret, PNG_INFO_PLTE) {
    return Err(CodecError::Format("Missing PLTE in a paletted image".into()));
  }
  let num = outs.ptr().add(1).read(sb)?.copy_and_verify(|n| {
    if (1..=PNG_MAX_PALETTE_LENGTH as u32).contains(&n) {
      Ok(n as usize)
    } else {
      Err(CodecError::Verification(format!("{n} palette entries")))
    }
  })?;
  let colors = outs.ptr().read(sb)?.into_ptr::<RGB8>().copy_and_verify_slice(
    sb,
    num,
    "any byte triple is a color",
  )?;
  drop(outs);
  fop.sequence_set_ncolors(num);
  for (i, &c) in colors.iter().enumerate() {
    fop.sequence_set_color(i, c);
  }

  let outs = sb.malloc_in_sandbox::<u32>(2)?;
  let args = [png, info, outs.ptr().arg(), outs.ptr().add(1).arg(), Value::NULL];
  if !flag_set(sb.invoke(Export::GetTRNS, &args)?, PNG_INFO_TRNS) {
    return Ok(());
  }
  let num_trans = outs.ptr().add(1).read(sb)?.copy_and_verify(|n| {
    if n as usize <= num {
      Ok(n as usize)
    } else {
      Err(CodecError::Verification(format!("{n} alphas for {num} palette entries")))
    }
  })?;
  let alphas = outs.ptr().read(sb)?.into_ptr::<u8>().copy_and_verify_slice(
    sb,
    num_trans,
    "any byte is an alpha",
  )?;
  let mut mask = None;
  for (i, &a) in alphas.iter().enumerate() {
    fop.sequence_set_alpha(i, a);
    if a < 255 {
      fop.sequence_set_has_alpha(true);
      if a == 0 && mask.is_none() {
        mask = Some(i as u8);
      }
    }
  }
  if let Some(index) = mask {
    fop.set_transparent_color(index);
  }
  Ok(())
}

/// The single transparent color of an RGB or gray image, already reduced to
/// 8 bits by the codec.
fn read_trans_color(st: &StructGuard<'_>, color_type: u32) -> Result<Option<TransColor>> {
  let sb = st.sb;
  let out = sb.malloc_in_sandbox::<u32>(1)?;
  let args = [st.png(), st.info(), Value::NULL, Value::NULL, out.arg()];
  if !flag_set(sb.invoke(Export::GetTRNS, &args)?, PNG_INFO_TRNS) {
    return Ok(None);
  }
  let ptr = out.read_first()?.into_ptr::<Color16Raw>();
  if ptr.is_null() {
    return Ok(None);
  }
  ptr.read(sb)?.copy_and_verify(|c: Color16Raw| -> Result<Option<TransColor>> {
    let eight = |v: u16| {
      u8::try_from(v).map_err(|_| CodecError::Verification(format!("transparent sample {v}")))
    };
    Ok(match color_type {
      PNG_COLOR_TYPE_GRAY => Some(TransColor::Gray(eight(c.gray)?)),
      PNG_COLOR_TYPE_RGB => Some(TransColor::Rgb(RGB8::new(eight(c.red)?, eight(c.green)?, eight(c.blue)?))),
      _ => None,
    })
  })
}

/// Converts one row of 8-bit samples into row `y` of `image`. Returns whether
/// any pixel matched the transparent color.
fn convert_row(
  image: &mut Image, y: u32, color_type: u32, src: &[u8], trans: Option<TransColor>,
) -> Result<bool> {
  let missing = || CodecError::Resource(format!("image has no row {y}"));
  let mut matched = false;
  match color_type {
    PNG_COLOR_TYPE_RGB_ALPHA => {
      let dst = image.rgba_row_mut(y).ok_or_else(missing)?;
      for (d, s) in dst.iter_mut().zip(src.chunks_exact(4)) {
        *d = RGBA8::new(s[0], s[1], s[2], s[3]);
      }
    }
    PNG_COLOR_TYPE_RGB => {
      let dst = image.rgba_row_mut(y).ok_or_else(missing)?;
      for (d, s) in dst.iter_mut().zip(src.chunks_exact(3)) {
        let rgb = RGB8::new(s[0], s[1], s[2]);
        *d = RGBA8::from(rgb);
        if trans == Some(TransColor::Rgb(rgb)) {
          d.a = 0;
          matched = true;
        }
      }
    }
    PNG_COLOR_TYPE_GRAY_ALPHA => {
      let dst = image.ya_row_mut(y).ok_or_else(missing)?;
      for (d, s) in dst.iter_mut().zip(src.chunks_exact(2)) {
        *d = YA8::new(s[0], s[1]);
      }
    }
    PNG_COLOR_TYPE_GRAY => {
      let dst = image.ya_row_mut(y).ok_or_else(missing)?;
      for (d, &v) in dst.iter_mut().zip(src) {
        let transparent = trans == Some(TransColor::Gray(v));
        matched |= transparent;
        *d = YA8::new(v, if transparent { 0 } else { 255 });
      }
    }
    PNG_COLOR_TYPE_PALETTE => {
      let dst = image.row_mut(y).ok_or_else(missing)?;
      for (d, &i) in dst.iter_mut().zip(src) {
        *d = i;
      }
    }
    other => return Err(CodecError::Format(format!("Color type {other} not supported"))),
  }
  Ok(matched)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_verification() {
    assert!(Header::verify(&[4, 4, 8, 6, 0], 100).is_ok());
    assert!(Header::verify(&[0, 4, 8, 6, 0], 100).is_err());
    assert!(Header::verify(&[4, 101, 8, 6, 0], 100).is_err());
    assert!(Header::verify(&[4, 4, 3, 6, 0], 100).is_err());
    assert!(Header::verify(&[4, 4, 8, 6, 2], 100).is_err());
    assert!(Header::verify(&[4, 4, 8], 100).is_err());
    let odd = Header::verify(&[4, 4, 8, 5, 0], 100).unwrap();
    assert!(matches!(odd.layout(), Err(CodecError::Format(m)) if m == "Color type not supported"));
  }

  #[test]
  fn test_rgb_transparent_color_substitution() {
    let mut image = Image::try_new(PixelFormat::Rgb, 3, 1).unwrap();
    let src = [1, 2, 3, 9, 9, 9, 1, 2, 3];
    let trans = Some(TransColor::Rgb(RGB8::new(1, 2, 3)));
    assert!(convert_row(&mut image, 0, PNG_COLOR_TYPE_RGB, &src, trans).unwrap());
    assert_eq!(image.rgba_row(0).unwrap(), &[
      RGBA8::new(1, 2, 3, 0),
      RGBA8::new(9, 9, 9, 255),
      RGBA8::new(1, 2, 3, 0)
    ]);
    assert!(!convert_row(&mut image, 0, PNG_COLOR_TYPE_RGB, &src, None).unwrap());
    assert!(image.rgba_row(0).unwrap().iter().all(|p| p.a == 255));
  }

  #[test]
  fn test_gray_transparent_color_substitution() {
    let mut image = Image::try_new(PixelFormat::Grayscale, 2, 1).unwrap();
    let trans = Some(TransColor::Gray(0x55));
    assert!(convert_row(&mut image, 0, PNG_COLOR_TYPE_GRAY, &[0x55, 0xAA], trans).unwrap());
    assert_eq!(image.ya_row(0).unwrap(), &[YA8::new(0x55, 0), YA8::new(0xAA, 255)]);
    assert!(convert_row(&mut image, 1, PNG_COLOR_TYPE_GRAY, &[0, 0], trans).is_err());
  }

  #[test]
  fn test_unknown_color_type_is_not_indexed() {
    let mut image = Image::try_new(PixelFormat::Indexed, 2, 1).unwrap();
    assert!(!convert_row(&mut image, 0, PNG_COLOR_TYPE_PALETTE, &[3, 4], None).unwrap());
    assert_eq!(image.row(0).unwrap(), &[3, 4]);
    let err = convert_row(&mut image, 0, 5, &[7, 7], None).unwrap_err();
    assert!(matches!(err, CodecError::Format(_)));
    assert_eq!(image.row(0).unwrap(), &[3, 4]);
  }
}
