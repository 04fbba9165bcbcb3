//! Color space metadata in both directions.

use tracing::{debug, warn};

use super::{copy_c_str, flag_set, StructGuard};
use crate::{
  color_space::{fixtof, ftofix, Primaries, SrgbIntent},
  guest::abi::{Export, PNG_COMPRESSION_TYPE_BASE, PNG_INFO_CHRM, PNG_INFO_GAMA, PNG_INFO_ICCP, PNG_INFO_SRGB},
  sandbox::{Tainted, Value},
  CodecError, ColorSpace, Result,
};

/// Longest iCCP profile name, NUL included.
const ICC_NAME_MAX: u32 = 80;

/// Name written when an ICC profile doesn't have one.
const DEFAULT_ICC_NAME: &str = "ICC profile";

/// A fixed-point value the codec wrote. PNG only allows `0..=i32::MAX`.
fn fixed(value: Tainted<u32>) -> Result<i32> {
  value.copy_and_verify(|v| {
    i32::try_from(v).map_err(|_| CodecError::Verification(format!("fixed-point value {v:#x}")))
  })
}

/// The embedded color space, if the file has one.
///
/// The first match wins: an ICC profile, then the `sRGB` marker, then
/// chromaticities (with the file's gamma, or the sRGB curve without one),
/// then gamma alone on the sRGB primaries.
pub(super) fn load_color_space(st: &StructGuard<'_>) -> Result<Option<ColorSpace>> {
  let sb = st.sb;
  let (png, info) = (st.png(), st.info());

  let outs = sb.malloc_in_sandbox::<u32>(4)?;
  let out = |i: u32| outs.ptr().add(i).arg();
  let ret = sb.invoke(Export::GetICCP, &[png, info, out(0), out(1), out(2), out(3)])?;
  if flag_set(ret, PNG_INFO_ICCP) {
    let max = sb.config().max_chunk_size;
    let len = outs.ptr().add(3).read(sb)?.copy_and_verify(|len| {
      if len <= max {
        Ok(len)
      } else {
        Err(CodecError::Verification(format!("ICC profile length {len}")))
      }
    })?;
    let name_ptr = outs.ptr().read(sb)?.into_ptr::<u8>();
    let name = if name_ptr.is_null() {
      String::new()
    } else {
      name_ptr.copy_and_verify_string(sb, ICC_NAME_MAX, "profile name is only a label")?
    };
    let profile_ptr = outs.ptr().add(2).read(sb)?.into_ptr::<u8>();
    let profile =
      profile_ptr.copy_and_verify_slice(sb, len as usize, "profile is opaque bytes of the given length")?;
    debug!(len, %name, "embedded ICC profile");
    return Ok(Some(ColorSpace::Icc { name, profile }));
  }
  drop(outs);

  if flag_set(sb.invoke(Export::GetValid, &[png, info, Value(PNG_INFO_SRGB)])?, PNG_INFO_SRGB) {
    return Ok(Some(ColorSpace::srgb()));
  }

  let gamma = || -> Result<Option<f64>> {
    let out = sb.malloc_in_sandbox::<u32>(1)?;
    if !flag_set(sb.invoke(Export::GetGAMAFixed, &[png, info, out.arg()])?, PNG_INFO_GAMA) {
      return Ok(None);
    }
    match fixed(out.read_first()?)? {
      0 => Err(CodecError::Verification("zero gamma".into())),
      inv => Ok(Some(1.0 / fixtof(inv))),
    }
  };

  let outs = sb.malloc_in_sandbox::<u32>(8)?;
  let mut args = vec![png, info];
  args.extend((0..8).map(|i| outs.ptr().add(i).arg()));
  if flag_set(sb.invoke(Export::GetCHRMFixed, &args)?, PNG_INFO_CHRM) {
    let mut xy = [0.0; 8];
    for (i, v) in xy.iter_mut().enumerate() {
      *v = fixtof(fixed(outs.ptr().add(i as u32).read(sb)?)?);
    }
    drop(outs);
    let primaries = Primaries::from_array(xy);
    return Ok(Some(ColorSpace::Rgb { primaries, gamma: gamma()? }));
  }
  drop(outs);

  Ok(gamma()?.map(|g| ColorSpace::Srgb { gamma: Some(g) }))
}

/// Hands `color_space` to the codec so it gets written with the header.
pub(super) fn save_color_space(st: &StructGuard<'_>, color_space: &ColorSpace) -> Result<()> {
  let sb = st.sb;
  let (png, info) = (st.png(), st.info());
  let set_gamma = |gamma: f64| -> Result<()> {
    if !(gamma.is_finite() && gamma > 0.0) {
      warn!(gamma, "unusable gamma not saved");
      return Ok(());
    }
    st.check(sb.invoke(Export::SetGAMAFixed, &[png, info, Value::from(ftofix(1.0 / gamma))])?)
  };
  match color_space {
    ColorSpace::None => Ok(()),
    ColorSpace::Srgb { gamma: None } => {
      let intent = Value(SrgbIntent::Perceptual.to_png_value());
      st.check(sb.invoke(Export::SetSRGB, &[png, info, intent])?)
    }
    ColorSpace::Srgb { gamma: Some(g) } => set_gamma(*g),
    ColorSpace::Rgb { primaries, gamma } => {
      let mut args = vec![png, info];
      args.extend(primaries.to_array().iter().map(|&v| Value::from(ftofix(v))));
      st.check(sb.invoke(Export::SetCHRMFixed, &args)?)?;
      match gamma {
        Some(g) => set_gamma(*g),
        None => Ok(()),
      }
    }
    ColorSpace::Icc { name, profile } => {
      let name = if name.is_empty() { DEFAULT_ICC_NAME } else { name.as_str() };
      let mut end = name.len().min(ICC_NAME_MAX as usize - 1);
      while !name.is_char_boundary(end) {
        end -= 1;
      }
      let name = copy_c_str(sb, &name[..end])?;
      let data = sb.malloc_in_sandbox::<u8>(profile.len())?;
      data.copy_in(profile)?;
      let len = Value(data.len() as u32);
      let compression = Value(PNG_COMPRESSION_TYPE_BASE);
      st.check(sb.invoke(Export::SetICCP, &[png, info, name.arg(), compression, data.arg(), len])?)
    }
  }
}
