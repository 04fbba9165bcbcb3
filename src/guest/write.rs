//! The write side: `png_write_info`, `png_write_row`, `png_write_end`.

use tracing::{debug, trace};

use super::{
  abi::{PNG_AFTER_IDAT, PNG_HAVE_IHDR, PNG_HAVE_PLTE},
  chunk::{self, tag_str, PNG_SIGNATURE},
  header::ColorType,
  info::Trns,
  png_error, Codec, GResult, Guest,
};

/// Largest IDAT payload written.
const IDAT_SIZE: usize = 32 * 1024;

/// miniz_oxide's default level.
const COMPRESSION_LEVEL: u8 = 6;

#[derive(Debug, Default)]
pub(crate) struct WriteState {
  info_written: bool,
  /// Filtered scanlines waiting for `png_write_end`.
  raw: Vec<u8>,
  rows: u32,
  ended: bool,
}

fn write_chunk(g: &Guest<'_>, tag: [u8; 4], data: &[u8]) -> GResult<()> {
  let bytes = chunk::serialize(tag, data)
    .ok_or_else(|| png_error(format!("{}: chunk too large", tag_str(tag))))?;
  trace!(tag = %tag_str(tag), len = data.len(), "write chunk");
  g.write_data(&bytes)
}

fn write_unknowns(g: &Guest<'_>, c: &Codec, location: u32) -> GResult<()> {
  for u in c.info.unknowns.iter().filter(|u| u.location == location) {
    write_chunk(g, u.tag, &u.data)?;
  }
  Ok(())
}

pub(crate) fn write_info(g: &Guest<'_>, c: &mut Codec) -> GResult<()> {
  if c.write.info_written {
    return Err(png_error("png_write_info called twice"));
  }
  let Some(ihdr) = c.info.ihdr else {
    return Err(png_error("png_write_info called before png_set_IHDR"));
  };
  if ihdr.color_type == ColorType::Index && c.info.palette.is_empty() {
    return Err(png_error("Valid palette required for paletted images"));
  }
  g.write_data(&PNG_SIGNATURE)?;
  write_chunk(g, chunk::IHDR, &ihdr.to_bytes())?;
  if let Some(gama) = c.info.gama {
    write_chunk(g, chunk::GAMA, &gama.to_be_bytes())?;
  }
  if let Some(chrm) = c.info.chrm {
    let data: Vec<u8> = chrm.iter().flat_map(|v| v.to_be_bytes()).collect();
    write_chunk(g, chunk::CHRM, &data)?;
  }
  if let Some(iccp) = &c.info.iccp {
    let mut data = iccp.name.clone();
    data.extend_from_slice(&[0, 0]);
    data.extend(miniz_oxide::deflate::compress_to_vec_zlib(&iccp.profile, COMPRESSION_LEVEL));
    write_chunk(g, chunk::ICCP, &data)?;
  } else if let Some(intent) = c.info.srgb {
    write_chunk(g, chunk::SRGB, &[intent])?;
  }
  write_unknowns(g, c, PNG_HAVE_IHDR)?;
  let palette_allowed = matches!(ihdr.color_type, ColorType::Index | ColorType::Rgb | ColorType::Rgba);
  if palette_allowed && !c.info.palette.is_empty() {
    let data: Vec<u8> = c.info.palette.iter().flatten().copied().collect();
    write_chunk(g, chunk::PLTE, &data)?;
  }
  match &c.info.trns {
    Some(Trns::Alphas(a)) if !a.is_empty() => write_chunk(g, chunk::TRNS, a)?,
    Some(Trns::Gray(y)) => write_chunk(g, chunk::TRNS, &y.to_be_bytes())?,
    Some(Trns::Rgb(rgb)) => {
      let data: Vec<u8> = rgb.iter().flat_map(|v| v.to_be_bytes()).collect();
      write_chunk(g, chunk::TRNS, &data)?
    }
    _ => (),
  }
  write_unknowns(g, c, PNG_HAVE_PLTE)?;
  c.write.info_written = true;
  debug!(width = ihdr.width, height = ihdr.height, "info written");
  Ok(())
}

pub(crate) fn write_row(g: &Guest<'_>, c: &mut Codec, row_ptr: u32) -> GResult<()> {
  let Some(ihdr) = c.info.ihdr.filter(|_| c.write.info_written) else {
    return Err(png_error("png_write_info was never called before png_write_row"));
  };
  if c.write.rows >= ihdr.height {
    return Err(png_error("Too many rows written"));
  }
  let rowbytes = ihdr.bytes_per_scanline(ihdr.width);
  if c.write.raw.len().saturating_add(rowbytes + 1) > g.config().memory_budget() {
    return Err(png_error("Image too large to encode"));
  }
  let row = g.load_bytes(row_ptr, rowbytes as u32)?;
  c.write.raw.try_reserve(rowbytes + 1).map_err(|_| png_error("Out of memory"))?;
  // filter type None
  c.write.raw.push(0);
  c.write.raw.extend_from_slice(&row);
  c.write.rows += 1;
  Ok(())
}

pub(crate) fn write_end(g: &Guest<'_>, c: &mut Codec) -> GResult<()> {
  let Some(ihdr) = c.info.ihdr.filter(|_| c.write.info_written) else {
    return Err(png_error("No IDATs written into file"));
  };
  if c.write.ended {
    return Err(png_error("png_write_end called twice"));
  }
  if c.write.rows != ihdr.height {
    return Err(png_error("Not enough image data"));
  }
  let raw = core::mem::take(&mut c.write.raw);
  let zlib = miniz_oxide::deflate::compress_to_vec_zlib(&raw, COMPRESSION_LEVEL);
  drop(raw);
  for piece in zlib.chunks(IDAT_SIZE) {
    write_chunk(g, chunk::IDAT, piece)?;
  }
  write_unknowns(g, c, PNG_AFTER_IDAT)?;
  write_chunk(g, chunk::IEND, &[])?;
  c.write.ended = true;
  debug!(compressed = zlib.len(), "write end");
  Ok(())
}
