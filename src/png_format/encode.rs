//! Saving a PNG: the host side of the write pipeline.

use std::{io::Write, rc::Rc};

use tracing::{debug, trace};

use super::{
  color, max_transfer, signal_stream_error, stream_error, OutputStream, StructGuard, StructKind,
};
use crate::{
  guest::abi::{
    Export, UnknownChunkRaw, PNG_COLOR_TYPE_GRAY, PNG_COLOR_TYPE_GRAY_ALPHA,
    PNG_COLOR_TYPE_PALETTE, PNG_COLOR_TYPE_RGB, PNG_COLOR_TYPE_RGB_ALPHA,
    PNG_COMPRESSION_TYPE_BASE, PNG_FILTER_TYPE_BASE, PNG_INTERLACE_NONE, PNG_MAX_PALETTE_LENGTH,
  },
  sandbox::{Tainted, Value},
  CodecError, EncodeOptions, FileOp, Image, PixelFormat, PngOptions, Result, Sandbox, RGB8,
};

/// Write callback: pushes `len` bytes at `data` to the output stream.
fn write_data(sb: &Sandbox, args: &[Tainted<u32>]) -> Result<u32> {
  let [png, data, len] = args else {
    return Err(CodecError::Verification(format!("write callback given {} arguments", args.len())));
  };
  let token = sb.invoke(Export::GetIoPtr, &[png.arg()])?;
  let stream = sb.lookup_app_ptr::<OutputStream>(&token)?;
  let max = max_transfer(sb.config());
  let len = len.clone().copy_and_verify(|n| {
    if n <= max {
      Ok(n as usize)
    } else {
      Err(CodecError::Verification(format!("write of {n} bytes requested")))
    }
  })?;
  let bytes =
    data.clone().into_ptr::<u8>().copy_and_verify_slice(sb, len, "bytes go to the file untouched")?;
  let written = stream.writer.borrow_mut().write_all(&bytes);
  match written {
    Ok(()) => trace!(len, "written"),
    Err(e) => {
      let msg = format!("write error: {e}");
      debug!(len, "{msg}");
      *stream.failure.borrow_mut() = Some(msg.clone());
      signal_stream_error(sb, png, &msg)?;
    }
  }
  Ok(0)
}

/// The PNG color type a document is saved as.
///
/// | host format | alpha needed | one-pixel fix-up | color type |
/// |---|---|---|---|
/// | RGB | either | on | RGB+alpha |
/// | RGB | yes | off | RGB+alpha |
/// | RGB | no | off | RGB |
/// | grayscale | either | on | gray+alpha |
/// | grayscale | yes | off | gray+alpha |
/// | grayscale | no | off | gray |
/// | indexed | either | on | RGB+alpha |
/// | indexed | either | off | palette |
#[must_use]
pub(crate) const fn target_color_type(
  format: PixelFormat, need_alpha: bool, fix_one_alpha_pixel: bool,
) -> u32 {
  match (format, need_alpha || fix_one_alpha_pixel, fix_one_alpha_pixel) {
    (PixelFormat::Rgb, true, _) => PNG_COLOR_TYPE_RGB_ALPHA,
    (PixelFormat::Rgb, false, _) => PNG_COLOR_TYPE_RGB,
    (PixelFormat::Grayscale, true, _) => PNG_COLOR_TYPE_GRAY_ALPHA,
    (PixelFormat::Grayscale, false, _) => PNG_COLOR_TYPE_GRAY,
    (PixelFormat::Indexed, _, true) => PNG_COLOR_TYPE_RGB_ALPHA,
    (PixelFormat::Indexed, _, false) => PNG_COLOR_TYPE_PALETTE,
  }
}

const fn channels(color_type: u32) -> u32 {
  match color_type {
    PNG_COLOR_TYPE_RGB_ALPHA => 4,
    PNG_COLOR_TYPE_RGB => 3,
    PNG_COLOR_TYPE_GRAY_ALPHA => 2,
    _ => 1,
  }
}

/// Saves `fop`'s document to the file it names.
pub(super) fn save(sb: &Sandbox, fop: &mut dyn FileOp, options: &EncodeOptions) -> Result<()> {
  let image = fop
    .sequence_image_to_save()
    .cloned()
    .ok_or_else(|| CodecError::Resource("no image to save".into()))?;
  let stream = Rc::new(OutputStream::new(fop.open_output()?));

  let write_cb = sb.register_callback(write_data);
  let file_ptr = sb.get_app_pointer(stream.clone());

  let st = StructGuard::create(sb, StructKind::Write)?;
  sb.invoke(Export::SetWriteFn, &[st.png(), file_ptr.arg(), write_cb.arg()])?;

  encode(&st, fop, &image, options).map_err(|e| stream_error(&stream.failure, e))?;
  drop(st);
  file_ptr.unregister();
  write_cb.unregister();

  stream.writer.borrow_mut().flush()?;
  Ok(())
}

fn encode(st: &StructGuard<'_>, fop: &mut dyn FileOp, image: &Image, options: &EncodeOptions) -> Result<()> {
  let sb = st.sb;
  let (png, info) = (st.png(), st.info());
  let fix = options.fix_one_alpha_pixel;
  let color_type = target_color_type(image.format(), fop.need_alpha(), fix);
  let (width, height) = (image.width(), image.height());
  debug!(width, height, color_type, fix, "saving png");

  st.check(sb.invoke(Export::SetIHDR, &[
    png,
    info,
    Value(width),
    Value(height),
    Value(8),
    Value(color_type),
    Value(PNG_INTERLACE_NONE),
    Value(PNG_COMPRESSION_TYPE_BASE),
    Value(PNG_FILTER_TYPE_BASE),
  ])?)?;

  if let Some(chunks) = fop.format_options().filter(|o| !o.is_empty()) {
    set_unknown_chunks(st, chunks)?;
  }
  if fop.preserve_color_profile() {
    color::save_color_space(st, fop.color_space())?;
  }
  if color_type == PNG_COLOR_TYPE_PALETTE {
    write_palette(st, &*fop)?;
  }
  st.check(sb.invoke(Export::WriteInfo, &[png, info])?)?;

  let expected = width.checked_mul(channels(color_type));
  let rowbytes = sb.invoke(Export::GetRowbytes, &[png, info])?.copy_and_verify(|n| {
    if Some(n) == expected {
      Ok(n as usize)
    } else {
      Err(CodecError::Verification(format!("rowbytes {n} for a {width} pixel row")))
    }
  })?;
  sb.invoke(Export::GetColorType, &[png, info])?.copy_and_verify(|ct| {
    if ct == color_type {
      Ok(())
    } else {
      Err(CodecError::Verification(format!("color type {ct}, expected {color_type}")))
    }
  })?;

  let row = sb.malloc_in_sandbox::<u8>(rowbytes)?;
  let mut line = Vec::with_capacity(rowbytes);
  for y in 0..height {
    line.clear();
    pack_row(&*fop, image, y, color_type, fix && y + 1 == height, &mut line)?;
    row.copy_in(&line)?;
    st.check(sb.invoke(Export::WriteRow, &[png, row.arg()])?)?;
    fop.set_progress(f64::from(y + 1) / f64::from(height));
  }
  drop(row);

  st.check(sb.invoke(Export::WriteEnd, &[png, info])?)
}

/// Hands the document's preserved chunks to the codec.
fn set_unknown_chunks(st: &StructGuard<'_>, options: &PngOptions) -> Result<()> {
  let sb = st.sb;
  let payloads = options
    .chunks()
    .iter()
    .map(|chunk| {
      let buf = sb.malloc_in_sandbox::<u8>(chunk.data.len())?;
      buf.copy_in(&chunk.data)?;
      Ok(buf)
    })
    .collect::<Result<Vec<_>>>()?;
  let mut raws = Vec::with_capacity(payloads.len());
  for (chunk, buf) in options.chunks().iter().zip(&payloads) {
    trace!(name = %String::from_utf8_lossy(&chunk.name), "write unknown chunk");
    let mut name = [0_u8; 8];
    name[..4].copy_from_slice(&chunk.name);
    raws.push(UnknownChunkRaw {
      name,
      data: buf.ptr().copy_and_verify_address(Ok::<u32, CodecError>)?,
      size: buf.len() as u32,
      location: chunk.placement.to_location(),
    });
  }
  let table = sb.malloc_in_sandbox::<UnknownChunkRaw>(raws.len())?;
  table.copy_in(&raws)?;
  let num = Value(raws.len() as u32);
  st.check(sb.invoke(Export::SetUnknownChunks, &[st.png(), st.info(), table.arg(), num])?)
}

/// Writes the palette and, when any entry isn't opaque or there's a mask
/// color, the palette alphas.
fn write_palette(st: &StructGuard<'_>, fop: &dyn FileOp) -> Result<()> {
  let sb = st.sb;
  let (png, info) = (st.png(), st.info());
  let pal_size = fop.sequence_get_ncolors().clamp(1, PNG_MAX_PALETTE_LENGTH);

  let colors: Vec<RGB8> = (0..pal_size).map(|c| fop.sequence_get_color(c)).collect();
  let palette = sb.malloc_in_sandbox::<RGB8>(pal_size)?;
  palette.copy_in(&colors)?;
  st.check(sb.invoke(Export::SetPLTE, &[png, info, palette.arg(), Value(pal_size as u32)])?)?;

  // without a visible background layer the mask color is see-through
  let mask = (!fop.background_layer_visible()).then(|| usize::from(fop.transparent_color()));
  let mut all_opaque = true;
  let alphas: Vec<u8> = (0..pal_size)
    .map(|c| {
      let alpha = fop.sequence_get_alpha(c);
      all_opaque &= alpha == 255;
      if Some(c) == mask {
        0
      } else {
        alpha
      }
    })
    .collect();
  if all_opaque && mask.is_none() {
    return Ok(());
  }
  let trans = sb.malloc_in_sandbox::<u8>(pal_size)?;
  trans.copy_in(&alphas)?;
  let num = Value(pal_size as u32);
  st.check(sb.invoke(Export::SetTRNS, &[png, info, trans.arg(), num, Value::NULL])?)
}

/// Converts row `y` of `image` into the samples of `color_type`.
///
/// When `fix_last_pixel` is set and the row is opaque up to its last pixel,
/// that pixel's alpha is written as 254.
fn pack_row(
  fop: &dyn FileOp, image: &Image, y: u32, color_type: u32, fix_last_pixel: bool,
  out: &mut Vec<u8>,
) -> Result<()> {
  let missing = || CodecError::Resource(format!("image has no row {y}"));
  let last = (image.width() as usize).saturating_sub(1);
  let mut opaque = true;
  let mut alpha = |x: usize, a: u8| -> u8 {
    if opaque {
      if a < 255 {
        opaque = false;
      } else if fix_last_pixel && x == last {
        return 254;
      }
    }
    a
  };
  match (color_type, image.format()) {
    (PNG_COLOR_TYPE_RGB_ALPHA, PixelFormat::Rgb) => {
      for (x, p) in image.rgba_row(y).ok_or_else(missing)?.iter().enumerate() {
        out.extend_from_slice(&[p.r, p.g, p.b, alpha(x, p.a)]);
      }
    }
    (PNG_COLOR_TYPE_RGB_ALPHA, PixelFormat::Indexed) => {
      for (x, &i) in image.row(y).ok_or_else(missing)?.iter().enumerate() {
        let c = fop.sequence_get_color(usize::from(i));
        let a = fop.sequence_get_alpha(usize::from(i));
        out.extend_from_slice(&[c.r, c.g, c.b, alpha(x, a)]);
      }
    }
    (PNG_COLOR_TYPE_RGB, PixelFormat::Rgb) => {
      for p in image.rgba_row(y).ok_or_else(missing)? {
        out.extend_from_slice(&[p.r, p.g, p.b]);
      }
    }
    (PNG_COLOR_TYPE_GRAY_ALPHA, PixelFormat::Grayscale) => {
      for (x, p) in image.ya_row(y).ok_or_else(missing)?.iter().enumerate() {
        out.extend_from_slice(&[p.y, alpha(x, p.a)]);
      }
    }
    (PNG_COLOR_TYPE_GRAY, PixelFormat::Grayscale) => {
      out.extend(image.ya_row(y).ok_or_else(missing)?.iter().map(|p| p.y));
    }
    (PNG_COLOR_TYPE_PALETTE, PixelFormat::Indexed) => {
      out.extend_from_slice(image.row(y).ok_or_else(missing)?);
    }
    (ct, format) => {
      return Err(CodecError::Format(format!("{format:?} images can't be saved as color type {ct}")));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{MemoryFileOp, RGBA8, YA8};

  #[test]
  fn test_color_type_table() {
    use PixelFormat::*;
    assert_eq!(target_color_type(Rgb, false, false), PNG_COLOR_TYPE_RGB);
    assert_eq!(target_color_type(Rgb, true, false), PNG_COLOR_TYPE_RGB_ALPHA);
    assert_eq!(target_color_type(Rgb, false, true), PNG_COLOR_TYPE_RGB_ALPHA);
    assert_eq!(target_color_type(Grayscale, false, false), PNG_COLOR_TYPE_GRAY);
    assert_eq!(target_color_type(Grayscale, true, false), PNG_COLOR_TYPE_GRAY_ALPHA);
    assert_eq!(target_color_type(Grayscale, false, true), PNG_COLOR_TYPE_GRAY_ALPHA);
    assert_eq!(target_color_type(Indexed, true, false), PNG_COLOR_TYPE_PALETTE);
    assert_eq!(target_color_type(Indexed, false, true), PNG_COLOR_TYPE_RGB_ALPHA);
  }

  #[test]
  fn test_one_pixel_fix_up() {
    let mut image = Image::try_new(PixelFormat::Rgb, 2, 1).unwrap();
    image.rgba_row_mut(0).unwrap().fill(RGBA8::new(1, 2, 3, 255));
    let fop = MemoryFileOp::default();
    let mut out = Vec::new();
    pack_row(&fop, &image, 0, PNG_COLOR_TYPE_RGB_ALPHA, true, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 255, 1, 2, 3, 254]);

    // a row that already has transparency is left alone
    image.rgba_row_mut(0).unwrap()[0].a = 7;
    out.clear();
    pack_row(&fop, &image, 0, PNG_COLOR_TYPE_RGB_ALPHA, true, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 7, 1, 2, 3, 255]);

    let mut gray = Image::try_new(PixelFormat::Grayscale, 1, 1).unwrap();
    gray.ya_row_mut(0).unwrap()[0] = YA8::new(80, 255);
    out.clear();
    pack_row(&fop, &gray, 0, PNG_COLOR_TYPE_GRAY_ALPHA, true, &mut out).unwrap();
    assert_eq!(out, [80, 254]);
  }

  #[test]
  fn test_indexed_as_rgba_uses_palette() {
    let mut image = Image::try_new(PixelFormat::Indexed, 2, 1).unwrap();
    image.row_mut(0).unwrap().copy_from_slice(&[1, 0]);
    let mut fop = MemoryFileOp::default();
    fop.palette = vec![RGB8::new(10, 20, 30), RGB8::new(40, 50, 60)];
    fop.palette_alpha = vec![255, 128];
    let mut out = Vec::new();
    pack_row(&fop, &image, 0, PNG_COLOR_TYPE_RGB_ALPHA, false, &mut out).unwrap();
    assert_eq!(out, [40, 50, 60, 128, 10, 20, 30, 255]);
    assert!(pack_row(&fop, &image, 0, PNG_COLOR_TYPE_GRAY, false, &mut out).is_err());
  }
}
