//! The read side: `png_read_info`, `png_read_row`, `png_read_end`.

use bitfrob::u8_replicate_bits;
use miniz_oxide::inflate::TINFLStatus;
use tracing::{debug, trace, warn};

use super::{
  abi::{PNG_AFTER_IDAT, PNG_HAVE_IHDR, PNG_HAVE_PLTE, PNG_MAX_PALETTE_LENGTH},
  chunk::{self, chunk_crc, is_critical, is_valid_tag, tag_str, PNG_SIGNATURE},
  header::{interlaced_pos_to_full_pos, pass_has_row, reduced_image_dimensions, ColorType, Ihdr, ADAM7},
  info::UnknownChunk,
  png_error,
  unfilter::{unfilter_row, BadFilter},
  Codec, GResult, Guest,
};

/// The `png_set_*` transforms the reader supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Transforms {
  pub(crate) strip_16: bool,
  pub(crate) packing: bool,
  pub(crate) expand_gray: bool,
  pub(crate) interlace: bool,
}
impl Transforms {
  #[inline]
  pub(crate) fn set(&mut self, f: impl FnOnce(&mut Self)) -> u32 {
    f(self);
    0
  }
}

#[derive(Debug, Default)]
pub(crate) struct ReadState {
  /// `PNG_HAVE_IHDR`, `PNG_HAVE_PLTE` and `PNG_AFTER_IDAT` bits.
  mode: u32,
  info_read: bool,
  /// Compressed image data collected so far.
  idat: Vec<Vec<u8>>,
  /// A chunk header read while looking for the end of the image data.
  next: Option<(u32, [u8; 4])>,
  /// Every output row, after the transforms.
  image: Option<Vec<u8>>,
  pass: u32,
  row: u32,
  ended: bool,
}

impl Codec {
  /// Bits per sample in the rows handed out.
  pub(crate) fn output_depth(&self) -> Option<u8> {
    let ihdr = self.info.ihdr?;
    let t = self.transforms;
    let d = ihdr.bit_depth;
    Some(if d == 16 && t.strip_16 {
      8
    } else if d < 8 && (t.packing || (ihdr.color_type == ColorType::Y && t.expand_gray)) {
      8
    } else {
      d
    })
  }

  /// Bytes in one output row.
  pub(crate) fn rowbytes(&self) -> u32 {
    match (self.info.ihdr, self.output_depth()) {
      (Some(ihdr), Some(depth)) => {
        let bits = (ihdr.width as u64) * (ihdr.color_type.channel_count() as u64) * u64::from(depth);
        u32::try_from((bits + 7) / 8).unwrap_or(u32::MAX)
      }
      _ => 0,
    }
  }

  fn passes(&self) -> u32 {
    match self.info.ihdr {
      Some(ihdr) if ihdr.is_interlaced && self.transforms.interlace => 7,
      _ => 1,
    }
  }
}

pub(crate) fn set_interlace_handling(c: &mut Codec) -> u32 {
  c.transforms.interlace = true;
  c.passes()
}

fn read_head(g: &Guest<'_>) -> GResult<(u32, [u8; 4])> {
  let b = g.read_data(8)?;
  let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
  let tag = [b[4], b[5], b[6], b[7]];
  if len > i32::MAX as u32 {
    return Err(png_error("PNG unsigned integer out of range"));
  }
  if !is_valid_tag(tag) {
    return Err(png_error("invalid chunk type"));
  }
  if len > g.config().max_chunk_size {
    return Err(png_error(format!("{}: chunk data is too large", tag_str(tag))));
  }
  trace!(tag = %tag_str(tag), len, "chunk");
  Ok((len, tag))
}

/// Reads the payload and checks the CRC. A bad CRC drops an ancillary chunk
/// (`None`) and is fatal for a critical one.
fn read_body(g: &Guest<'_>, len: u32, tag: [u8; 4]) -> GResult<Option<Vec<u8>>> {
  let total = len.checked_add(4).ok_or_else(|| png_error("PNG unsigned integer out of range"))?;
  let mut data = g.read_data(total)?;
  let stored = data.split_off(len as usize);
  let stored = u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]);
  if stored != chunk_crc(tag, &data) {
    if is_critical(tag) {
      return Err(png_error(format!("{}: CRC error", tag_str(tag))));
    }
    warn!(tag = %tag_str(tag), "CRC error, chunk dropped");
    return Ok(None);
  }
  Ok(Some(data))
}

fn read_palette(c: &mut Codec, ihdr: Ihdr, data: &[u8]) -> GResult<()> {
  let is_index = ihdr.color_type == ColorType::Index;
  let problem = if !c.info.palette.is_empty() {
    Some("Duplicate PLTE chunk")
  } else if matches!(ihdr.color_type, ColorType::Y | ColorType::Ya) {
    Some("PLTE: invalid with grayscale")
  } else if data.is_empty() || data.len() % 3 != 0 || data.len() / 3 > PNG_MAX_PALETTE_LENGTH {
    Some("Invalid palette length")
  } else {
    None
  };
  match problem {
    Some(msg) if is_index => Err(png_error(msg)),
    Some(msg) => {
      warn!("{msg}, ignored");
      Ok(())
    }
    None => {
      // entries past what the bit depth can index are never used
      let max = if is_index { 1 << ihdr.bit_depth } else { PNG_MAX_PALETTE_LENGTH };
      c.info.palette = data.chunks_exact(3).take(max).map(|e| [e[0], e[1], e[2]]).collect();
      c.read.mode |= PNG_HAVE_PLTE;
      Ok(())
    }
  }
}

/// Anything that isn't IDAT, before the image data.
fn handle_chunk(g: &Guest<'_>, c: &mut Codec, tag: [u8; 4], data: Vec<u8>) -> GResult<()> {
  if tag == chunk::IHDR {
    if c.info.ihdr.is_some() {
      return Err(png_error("Out of place IHDR"));
    }
    let ihdr =
      Ihdr::parse(&data, g.config().max_dimension).map_err(|e| png_error(e.message()))?;
    debug!(width = ihdr.width, height = ihdr.height, depth = ihdr.bit_depth, "IHDR");
    c.info.ihdr = Some(ihdr);
    c.read.mode |= PNG_HAVE_IHDR;
    return Ok(());
  }
  let Some(ihdr) = c.info.ihdr else {
    return Err(png_error(format!("{}: Missing IHDR before chunk", tag_str(tag))));
  };
  match tag {
    chunk::PLTE => read_palette(c, ihdr, &data),
    chunk::IEND => Err(png_error("No image in file")),
    chunk::TRNS | chunk::GAMA | chunk::CHRM | chunk::SRGB | chunk::ICCP => {
      let limit = g.config().max_chunk_size as usize;
      if let Err(e) = c.info.read_ancillary(tag, &data, limit) {
        warn!(tag = %tag_str(tag), "{e}, ignored");
      }
      Ok(())
    }
    other if is_critical(other) => {
      Err(png_error(format!("{}: unknown critical chunk", tag_str(other))))
    }
    other => {
      let location = if c.read.mode & PNG_HAVE_PLTE != 0 { PNG_HAVE_PLTE } else { PNG_HAVE_IHDR };
      g.deliver_unknown(&UnknownChunk { tag: other, data, location })
    }
  }
}

pub(crate) fn read_info(g: &Guest<'_>, c: &mut Codec) -> GResult<()> {
  if c.read.info_read {
    return Err(png_error("png_read_info called twice"));
  }
  if g.read_data(8)? != PNG_SIGNATURE {
    return Err(png_error("Not a PNG file"));
  }
  loop {
    let (len, tag) = read_head(g)?;
    if tag == chunk::IDAT {
      match c.info.ihdr {
        None => return Err(png_error("Missing IHDR before IDAT")),
        Some(h) if h.color_type == ColorType::Index && c.info.palette.is_empty() => {
          return Err(png_error("Missing PLTE before IDAT"))
        }
        Some(_) => (),
      }
      if let Some(data) = read_body(g, len, tag)? {
        c.read.idat.push(data);
      }
      break;
    }
    if let Some(data) = read_body(g, len, tag)? {
      handle_chunk(g, c, tag, data)?;
    }
  }
  c.read.info_read = true;
  debug!(valid = c.info.valid(), "info read");
  Ok(())
}

pub(crate) fn read_update_info(_g: &Guest<'_>, c: &mut Codec) -> GResult<()> {
  if !c.read.info_read {
    return Err(png_error("png_read_update_info called before png_read_info"));
  }
  trace!(rowbytes = c.rowbytes(), depth = c.output_depth(), "update info");
  Ok(())
}

fn try_zeroed(len: usize) -> GResult<Vec<u8>> {
  let mut v = Vec::new();
  v.try_reserve_exact(len).map_err(|_| png_error("Out of memory"))?;
  v.resize(len, 0);
  Ok(v)
}

/// Writes one source pixel into the output image.
struct Emitter<'o> {
  ihdr: Ihdr,
  out_depth: u8,
  expand: bool,
  rowbytes: usize,
  out: &'o mut [u8],
}
impl Emitter<'_> {
  fn emit_row(&mut self, level: usize, reduced_y: u32, reduced_width: u32, line: &[u8]) {
    let d = usize::from(self.ihdr.bit_depth);
    let channels = self.ihdr.color_type.channel_count();
    for rx in 0..reduced_width {
      let (x, y) = interlaced_pos_to_full_pos(level, rx, reduced_y);
      let row_start = y as usize * self.rowbytes;
      let x = x as usize;
      if d < 8 {
        let bit = rx as usize * d;
        let shift = 8 - d - (bit % 8);
        let v = (line[bit / 8] >> shift) & ((1_u8 << d) - 1);
        if self.out_depth == 8 {
          self.out[row_start + x] = if self.expand { u8_replicate_bits(d as u32, v) } else { v };
        } else {
          let out_bit = x * d;
          self.out[row_start + out_bit / 8] |= v << (8 - d - (out_bit % 8));
        }
        continue;
      }
      let src_px = channels * d / 8;
      let src = &line[rx as usize * src_px..][..src_px];
      let dst_px = channels * usize::from(self.out_depth) / 8;
      let dst = &mut self.out[row_start + x * dst_px..][..dst_px];
      if d == 16 && self.out_depth == 8 {
        for (o, s) in dst.iter_mut().zip(src.iter().step_by(2)) {
          *o = *s;
        }
      } else {
        dst.copy_from_slice(src);
      }
    }
  }
}

/// Reads the rest of the image data, inflates it, and unfilters every row
/// into its final place.
fn decode_image(g: &Guest<'_>, c: &mut Codec, ihdr: Ihdr) -> GResult<()> {
  loop {
    let (len, tag) = read_head(g)?;
    if tag != chunk::IDAT {
      c.read.next = Some((len, tag));
      break;
    }
    if let Some(data) = read_body(g, len, tag)? {
      c.read.idat.push(data);
    }
  }
  let zlen = ihdr.zlib_decompression_requirement();
  let rowbytes = c.rowbytes() as usize;
  let out_len = rowbytes.saturating_mul(ihdr.height as usize);
  if zlen.saturating_add(out_len) > g.config().memory_budget() {
    return Err(png_error("Image too large to decode"));
  }
  let mut zbuf = try_zeroed(zlen)?;
  let idat = core::mem::take(&mut c.read.idat);
  match miniz_oxide::inflate::decompress_slice_iter_to_slice(
    &mut zbuf,
    idat.iter().map(Vec::as_slice),
    true,
    true,
  ) {
    Ok(n) if n < zlen => return Err(png_error("Not enough image data")),
    Ok(_) => (),
    Err(TINFLStatus::HasMoreOutput) => warn!("Too much image data"),
    Err(TINFLStatus::FailedCannotMakeProgress) => return Err(png_error("Not enough image data")),
    Err(e) => return Err(png_error(format!("IDAT: decompression failed ({e:?})"))),
  }
  drop(idat);

  let mut out = try_zeroed(out_len)?;
  let out_depth = c.output_depth().unwrap_or(ihdr.bit_depth);
  let expand = c.transforms.expand_gray && ihdr.color_type == ColorType::Y;
  let mut emitter = Emitter { ihdr, out_depth, expand, rowbytes, out: &mut out };
  let levels = if ihdr.is_interlaced { 1..=7 } else { 0..=0 };
  let dims = reduced_image_dimensions(ihdr.width, ihdr.height);
  let bpp = ihdr.filter_bpp();
  let mut pos = 0;
  for level in levels {
    let (rw, rh) = dims[level];
    if rw == 0 || rh == 0 {
      continue;
    }
    let line = ihdr.bytes_per_scanline(rw);
    let mut prev: Vec<u8> = Vec::new();
    for ry in 0..rh {
      let filter = zbuf[pos];
      let cur = &mut zbuf[pos + 1..pos + 1 + line];
      unfilter_row(filter, cur, &prev, bpp)
        .map_err(|BadFilter(f)| png_error(format!("bad adaptive filter value {f}")))?;
      emitter.emit_row(level, ry, rw, cur);
      prev.clear();
      prev.extend_from_slice(cur);
      pos += 1 + line;
    }
  }
  debug!(rows = ihdr.height, rowbytes, "image decoded");
  c.read.image = Some(out);
  Ok(())
}

pub(crate) fn read_row(g: &Guest<'_>, c: &mut Codec, row_ptr: u32, display_ptr: u32) -> GResult<()> {
  let Some(ihdr) = c.info.ihdr.filter(|_| c.read.info_read) else {
    return Err(png_error("png_read_row called before png_read_info"));
  };
  if c.read.pass >= c.passes() {
    return Err(png_error("Too many calls to png_read_row"));
  }
  if c.read.image.is_none() {
    decode_image(g, c, ihdr)?;
  }
  let rowbytes = c.rowbytes() as usize;
  let y = c.read.row;
  let pass = c.read.pass as usize;
  let interlaced = c.passes() == 7;
  let px = ihdr.color_type.channel_count() * usize::from(c.output_depth().unwrap_or(8)) / 8;
  let Some(image) = c.read.image.as_ref() else {
    return Err(png_error("image data missing"));
  };
  let full = &image[y as usize * rowbytes..][..rowbytes];
  if row_ptr != 0 {
    if interlaced && px > 0 {
      // only this pass's pixels change
      if pass_has_row(pass, y) {
        let mut row = g.load_bytes(row_ptr, rowbytes as u32)?;
        let (x0, _, dx, _) = ADAM7[pass];
        for x in (x0 as usize..ihdr.width as usize).step_by(dx as usize) {
          row[x * px..][..px].copy_from_slice(&full[x * px..][..px]);
        }
        g.write_bytes(row_ptr, &row)?;
      }
    } else {
      g.write_bytes(row_ptr, full)?;
    }
  }
  if display_ptr != 0 {
    g.write_bytes(display_ptr, full)?;
  }
  c.read.row += 1;
  if c.read.row == ihdr.height {
    c.read.row = 0;
    c.read.pass += 1;
  }
  Ok(())
}

pub(crate) fn read_end(g: &Guest<'_>, c: &mut Codec) -> GResult<()> {
  if !c.read.info_read {
    return Err(png_error("png_read_end called before png_read_info"));
  }
  if c.read.ended {
    return Ok(());
  }
  let mut head = c.read.next.take();
  loop {
    let (len, tag) = match head.take() {
      Some(h) => h,
      None => read_head(g)?,
    };
    if tag == chunk::IDAT {
      if c.read.mode & PNG_AFTER_IDAT != 0 {
        return Err(png_error("Too many IDATs found"));
      }
      // image data nobody asked for
      read_body(g, len, tag)?;
      continue;
    }
    c.read.mode |= PNG_AFTER_IDAT;
    let Some(data) = read_body(g, len, tag)? else {
      continue;
    };
    match tag {
      chunk::IEND => break,
      chunk::IHDR | chunk::PLTE => {
        return Err(png_error(format!("{}: out of place", tag_str(tag))))
      }
      other if chunk::KNOWN.contains(&other) => {
        warn!(tag = %tag_str(other), "out of place after image data, ignored");
      }
      other if is_critical(other) => {
        return Err(png_error(format!("{}: unknown critical chunk", tag_str(other))))
      }
      other => g.deliver_unknown(&UnknownChunk { tag: other, data, location: PNG_AFTER_IDAT })?,
    }
  }
  c.read.ended = true;
  c.read.image = None;
  debug!("read end");
  Ok(())
}
