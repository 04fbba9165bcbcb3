//! Image metadata: what `png_infop` holds, and the `png_get_*` / `png_set_*`
//! calls on it.

use bitfrob::u8_replicate_bits;
use tracing::{trace, warn};

use super::{
  abi::*,
  chunk::{self, is_valid_tag, tag_str},
  header::{ColorType, Ihdr},
  png_error, Codec, GResult, Guest, Mirror,
};

/// Transparency data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Trns {
  /// One alpha per palette entry, possibly fewer than the palette.
  Alphas(Vec<u8>),
  /// The one gray value that is fully transparent.
  Gray(u16),
  /// The one RGB value that is fully transparent.
  Rgb([u16; 3]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Iccp {
  pub(crate) name: Vec<u8>,
  pub(crate) profile: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UnknownChunk {
  pub(crate) tag: [u8; 4],
  pub(crate) data: Vec<u8>,
  /// One of `PNG_HAVE_IHDR`, `PNG_HAVE_PLTE`, `PNG_AFTER_IDAT`.
  pub(crate) location: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Info {
  pub(crate) ihdr: Option<Ihdr>,
  pub(crate) palette: Vec<[u8; 3]>,
  pub(crate) trns: Option<Trns>,
  pub(crate) iccp: Option<Iccp>,
  pub(crate) srgb: Option<u8>,
  /// white x/y, red x/y, green x/y, blue x/y, all times 100000
  pub(crate) chrm: Option<[u32; 8]>,
  pub(crate) gama: Option<u32>,
  /// Only used when writing. Read-side unknowns go straight to the callback.
  pub(crate) unknowns: Vec<UnknownChunk>,
}

impl Info {
  pub(crate) fn valid(&self) -> u32 {
    let mut flags = 0;
    if self.gama.is_some() {
      flags |= PNG_INFO_GAMA;
    }
    if self.chrm.is_some() {
      flags |= PNG_INFO_CHRM;
    }
    if !self.palette.is_empty() {
      flags |= PNG_INFO_PLTE;
    }
    if self.trns.is_some() {
      flags |= PNG_INFO_TRNS;
    }
    if self.srgb.is_some() {
      flags |= PNG_INFO_SRGB;
    }
    if self.iccp.is_some() {
      flags |= PNG_INFO_ICCP;
    }
    flags
  }

  /// Takes in one of the ancillary chunks the codec understands.
  ///
  /// An `Err` is a benign problem: the caller warns and skips the chunk.
  pub(crate) fn read_ancillary(
    &mut self, tag: [u8; 4], data: &[u8], max_size: usize,
  ) -> Result<(), String> {
    let Some(ihdr) = self.ihdr else {
      return Err("missing IHDR".into());
    };
    match tag {
      chunk::TRNS => {
        if self.trns.is_some() {
          return Err("duplicate".into());
        }
        self.trns = Some(match (ihdr.color_type, data) {
          (ColorType::Index, _) if self.palette.is_empty() => {
            return Err("missing PLTE before tRNS".into())
          }
          (ColorType::Index, alphas) if alphas.len() <= self.palette.len() => {
            Trns::Alphas(alphas.to_vec())
          }
          (ColorType::Y, [y0, y1]) => Trns::Gray(u16::from_be_bytes([*y0, *y1])),
          (ColorType::Rgb, [r0, r1, g0, g1, b0, b1]) => Trns::Rgb([
            u16::from_be_bytes([*r0, *r1]),
            u16::from_be_bytes([*g0, *g1]),
            u16::from_be_bytes([*b0, *b1]),
          ]),
          (ColorType::Ya | ColorType::Rgba, _) => return Err("invalid with alpha channel".into()),
          _ => return Err("invalid length".into()),
        });
        let max = (1_u32 << ihdr.bit_depth) - 1;
        let out_of_range = match &self.trns {
          Some(Trns::Gray(y)) => u32::from(*y) > max,
          Some(Trns::Rgb(rgb)) => rgb.iter().any(|&s| u32::from(s) > max),
          _ => false,
        };
        if out_of_range {
          self.trns = None;
          return Err("out-of-range sample for the bit depth".into());
        }
      }
      chunk::GAMA => {
        let g = be_u32s::<1>(data).ok_or("invalid length")?[0];
        if g == 0 || g > i32::MAX as u32 {
          return Err("invalid gamma value".into());
        }
        self.gama.get_or_insert(g);
      }
      chunk::CHRM => {
        let values = be_u32s::<8>(data).ok_or("invalid length")?;
        if values.iter().any(|&v| v > i32::MAX as u32) {
          return Err("invalid values".into());
        }
        self.chrm.get_or_insert(values);
      }
      chunk::SRGB => match data {
        [intent @ 0..=3] => {
          self.srgb.get_or_insert(*intent);
        }
        _ => return Err("invalid rendering intent".into()),
      },
      chunk::ICCP => {
        if self.iccp.is_some() {
          return Err("duplicate".into());
        }
        let nul = data.iter().take(80).position(|&b| b == 0).ok_or("bad keyword")?;
        if nul == 0 {
          return Err("bad keyword".into());
        }
        let (name, rest) = data.split_at(nul);
        match rest {
          [0, 0, zdata @ ..] => {
            let profile = miniz_oxide::inflate::decompress_to_vec_zlib_with_limit(zdata, max_size)
              .map_err(|e| format!("profile decompression failed: {:?}", e.status))?;
            check_icc_profile(&profile)?;
            self.iccp = Some(Iccp { name: name.to_vec(), profile });
          }
          _ => return Err("bad compression method".into()),
        }
      }
      other => return Err(format!("{} is not handled here", tag_str(other))),
    }
    trace!(tag = %tag_str(tag), len = data.len(), "ancillary chunk stored");
    Ok(())
  }

  /// The transparent color at the depth rows will have after the transforms.
  fn trans_color(&self, transforms: &super::read::Transforms) -> Option<Color16Raw> {
    let ihdr = self.ihdr?;
    let norm = |v: u16| -> u16 {
      if ihdr.bit_depth == 16 && transforms.strip_16 {
        v >> 8
      } else if ihdr.bit_depth < 8 && transforms.expand_gray {
        u16::from(u8_replicate_bits(u32::from(ihdr.bit_depth), v as u8))
      } else {
        v
      }
    };
    match self.trns.as_ref()? {
      Trns::Alphas(_) => Some(Color16Raw::default()),
      Trns::Gray(y) => Some(Color16Raw { gray: norm(*y), ..Color16Raw::default() }),
      Trns::Rgb([r, g, b]) => {
        Some(Color16Raw { red: norm(*r), green: norm(*g), blue: norm(*b), ..Color16Raw::default() })
      }
    }
  }
}

fn be_u32s<const N: usize>(data: &[u8]) -> Option<[u32; N]> {
  if data.len() != N * 4 {
    return None;
  }
  let mut out = [0_u32; N];
  for (o, c) in out.iter_mut().zip(data.chunks_exact(4)) {
    *o = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
  }
  Some(out)
}

/// The checks both sides apply to an ICC profile: the header is there, its
/// length field matches, and the magic is right.
pub(crate) fn check_icc_profile(profile: &[u8]) -> Result<(), String> {
  if profile.len() < 132 {
    return Err("profile too short".into());
  }
  let declared = u32::from_be_bytes([profile[0], profile[1], profile[2], profile[3]]);
  if declared as usize != profile.len() {
    return Err(format!("profile length {declared} does not match data length {}", profile.len()));
  }
  if &profile[36..40] != b"acsp" {
    return Err("invalid profile signature".into());
  }
  Ok(())
}

pub(crate) fn get_ihdr(g: &Guest<'_>, c: &mut Codec, outs: &[u32]) -> GResult<u32> {
  let Some(ihdr) = c.info.ihdr else {
    return Ok(0);
  };
  let values = [
    ihdr.width,
    ihdr.height,
    u32::from(ihdr.bit_depth),
    ihdr.color_type as u32,
    ihdr.is_interlaced as u32,
  ];
  for (&out, v) in outs.iter().zip(values) {
    g.store_u32(out, v)?;
  }
  Ok(1)
}

pub(crate) fn get_plte(g: &Guest<'_>, c: &mut Codec, pal_out: u32, num_out: u32) -> GResult<u32> {
  if c.info.palette.is_empty() {
    return Ok(0);
  }
  let bytes: Vec<u8> = c.info.palette.iter().flatten().copied().collect();
  let addr = g.publish(c, Mirror::Palette, &bytes)?;
  g.store_u32(pal_out, addr)?;
  g.store_u32(num_out, c.info.palette.len() as u32)?;
  Ok(PNG_INFO_PLTE)
}

pub(crate) fn get_trns(
  g: &Guest<'_>, c: &mut Codec, trans_out: u32, num_out: u32, color_out: u32,
) -> GResult<u32> {
  let Some(color) = c.info.trans_color(&c.transforms) else {
    return Ok(0);
  };
  let (alphas, num) = match &c.info.trns {
    Some(Trns::Alphas(a)) => (Some(a.clone()), a.len() as u32),
    _ => (None, 1),
  };
  let alpha_addr = match alphas {
    Some(a) => g.publish(c, Mirror::TransAlpha, &a)?,
    None => 0,
  };
  let color_addr = g.publish(c, Mirror::TransColor, bytemuck::bytes_of(&color))?;
  g.store_u32(trans_out, alpha_addr)?;
  g.store_u32(num_out, num)?;
  g.store_u32(color_out, color_addr)?;
  Ok(PNG_INFO_TRNS)
}

pub(crate) fn get_iccp(g: &Guest<'_>, c: &mut Codec, outs: &[u32]) -> GResult<u32> {
  let Some(iccp) = c.info.iccp.clone() else {
    return Ok(0);
  };
  let mut name = iccp.name;
  name.push(0);
  let name_addr = g.publish(c, Mirror::IccName, &name)?;
  let profile_addr = g.publish(c, Mirror::IccProfile, &iccp.profile)?;
  let values = [name_addr, PNG_COMPRESSION_TYPE_BASE, profile_addr, iccp.profile.len() as u32];
  for (&out, v) in outs.iter().zip(values) {
    g.store_u32(out, v)?;
  }
  Ok(PNG_INFO_ICCP)
}

pub(crate) fn get_chrm(g: &Guest<'_>, c: &mut Codec, outs: &[u32]) -> GResult<u32> {
  let Some(values) = c.info.chrm else {
    return Ok(0);
  };
  for (&out, v) in outs.iter().zip(values) {
    g.store_u32(out, v)?;
  }
  Ok(PNG_INFO_CHRM)
}

pub(crate) fn get_gama(g: &Guest<'_>, c: &mut Codec, out: u32) -> GResult<u32> {
  let Some(gama) = c.info.gama else {
    return Ok(0);
  };
  g.store_u32(out, gama)?;
  Ok(PNG_INFO_GAMA)
}

pub(crate) fn set_ihdr(g: &Guest<'_>, c: &mut Codec, a: &[u32]) -> GResult<()> {
  let &[width, height, bit_depth, color_type, interlace, compression, filter] = a else {
    return Err(png_error("png_set_IHDR: bad arguments"));
  };
  let ihdr = Ihdr::validate(
    width,
    height,
    bit_depth,
    color_type,
    interlace,
    compression,
    filter,
    g.config().max_dimension,
  )
  .map_err(|e| png_error(e.message()))?;
  if ihdr.is_interlaced {
    return Err(png_error("Interlaced writing is not supported"));
  }
  c.info.ihdr = Some(ihdr);
  Ok(())
}

pub(crate) fn set_plte(g: &Guest<'_>, c: &mut Codec, pal_ptr: u32, num: u32) -> GResult<()> {
  let is_palette = c.info.ihdr.is_some_and(|h| h.color_type == ColorType::Index);
  if num as usize > PNG_MAX_PALETTE_LENGTH || (num == 0 && is_palette) {
    return Err(png_error("Invalid palette length"));
  }
  let bytes = g.load_bytes(pal_ptr, num * 3)?;
  c.info.palette = bytes.chunks_exact(3).map(|e| [e[0], e[1], e[2]]).collect();
  Ok(())
}

pub(crate) fn set_trns(
  g: &Guest<'_>, c: &mut Codec, trans_ptr: u32, num: u32, color_ptr: u32,
) -> GResult<()> {
  let Some(ihdr) = c.info.ihdr else {
    return Err(png_error("png_set_tRNS called before png_set_IHDR"));
  };
  c.info.trns = match ihdr.color_type {
    ColorType::Index => {
      if num as usize > PNG_MAX_PALETTE_LENGTH {
        return Err(png_error("Invalid number of transparent colors specified"));
      }
      let alphas = if num > 0 { g.load_bytes(trans_ptr, num)? } else { Vec::new() };
      Some(Trns::Alphas(alphas))
    }
    ColorType::Y | ColorType::Rgb => {
      let color: Color16Raw = g.load(color_ptr)?;
      let max = (1_u32 << ihdr.bit_depth) - 1;
      let samples = if ihdr.color_type == ColorType::Y {
        vec![color.gray]
      } else {
        vec![color.red, color.green, color.blue]
      };
      if samples.iter().any(|&s| u32::from(s) > max) {
        warn!("tRNS chunk has out-of-range samples for bit_depth");
        return Ok(());
      }
      Some(match samples[..] {
        [y] => Trns::Gray(y),
        [r, gr, b] => Trns::Rgb([r, gr, b]),
        _ => return Ok(()),
      })
    }
    ColorType::Ya | ColorType::Rgba => {
      warn!("tRNS invalid with alpha channel");
      None
    }
  };
  Ok(())
}

pub(crate) fn set_iccp(g: &Guest<'_>, c: &mut Codec, a: &[u32]) -> GResult<()> {
  let &[name_ptr, compression, profile_ptr, len] = a else {
    return Err(png_error("png_set_iCCP: bad arguments"));
  };
  let name = g.load_c_str(name_ptr, 80)?;
  if name.is_empty() || name.len() > 79 {
    return Err(png_error("iCCP: invalid keyword"));
  }
  if compression != PNG_COMPRESSION_TYPE_BASE {
    return Err(png_error("iCCP: unknown compression method"));
  }
  if len > g.config().max_chunk_size {
    return Err(png_error("iCCP: profile too large"));
  }
  let profile = g.load_bytes(profile_ptr, len)?;
  match check_icc_profile(&profile) {
    Ok(()) => c.info.iccp = Some(Iccp { name, profile }),
    Err(e) => warn!("iCCP: {e}, profile not stored"),
  }
  Ok(())
}

pub(crate) fn set_srgb(c: &mut Codec, intent: u32) -> GResult<()> {
  let intent = u8::try_from(intent).ok().filter(|&i| i <= 3);
  c.info.srgb = Some(intent.ok_or_else(|| png_error("sRGB: invalid rendering intent"))?);
  Ok(())
}

pub(crate) fn set_chrm(c: &mut Codec, a: &[u32]) -> GResult<()> {
  let values: [u32; 8] = a.try_into().map_err(|_| png_error("png_set_cHRM_fixed: bad arguments"))?;
  if values.iter().any(|&v| v > i32::MAX as u32) {
    return Err(png_error("cHRM: invalid values"));
  }
  c.info.chrm = Some(values);
  Ok(())
}

pub(crate) fn set_gama(c: &mut Codec, gama: u32) -> GResult<()> {
  if gama == 0 || gama > i32::MAX as u32 {
    return Err(png_error("gAMA: invalid gamma value"));
  }
  c.info.gama = Some(gama);
  Ok(())
}

pub(crate) fn set_unknown_chunks(g: &Guest<'_>, c: &mut Codec, ptr: u32, num: u32) -> GResult<()> {
  let stride = core::mem::size_of::<UnknownChunkRaw>() as u32;
  for i in 0..num {
    let at = i.checked_mul(stride).and_then(|off| ptr.checked_add(off));
    let raw: UnknownChunkRaw = g.load(at.ok_or(crate::Trap::OutOfBounds { addr: ptr, len: u32::MAX })?)?;
    let tag = [raw.name[0], raw.name[1], raw.name[2], raw.name[3]];
    if !is_valid_tag(tag) || chunk::KNOWN.contains(&tag) {
      warn!(tag = %tag_str(tag), "unknown chunk not stored");
      continue;
    }
    if raw.size > g.config().max_chunk_size {
      return Err(png_error(format!("{}: chunk too large", tag_str(tag))));
    }
    let data = g.load_bytes(raw.data, raw.size)?;
    // keep only the most significant location bit
    let location = match raw.location & (PNG_HAVE_IHDR | PNG_HAVE_PLTE | PNG_AFTER_IDAT) {
      0 => PNG_HAVE_IHDR,
      bits => 1 << (31 - bits.leading_zeros()),
    };
    c.info.unknowns.push(UnknownChunk { tag, data, location });
  }
  Ok(())
}
