//! Image header parsing and the interlace geometry that falls out of it.

use super::abi::{PNG_COMPRESSION_TYPE_BASE, PNG_FILTER_TYPE_BASE};

/// The types of color that PNG supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub(crate) enum ColorType {
  /// Greyscale
  Y = 0,
  /// Red, Green, Blue
  Rgb = 2,
  /// Index into a palette.
  Index = 3,
  /// Greyscale + Alpha
  Ya = 4,
  /// Red, Green, Blue, Alpha
  Rgba = 6,
}
impl ColorType {
  /// The number of channels in this type of color.
  pub(crate) const fn channel_count(self) -> usize {
    match self {
      Self::Y => 1,
      Self::Rgb => 3,
      Self::Index => 1,
      Self::Ya => 2,
      Self::Rgba => 4,
    }
  }
}
impl TryFrom<u8> for ColorType {
  type Error = ();
  fn try_from(value: u8) -> Result<Self, Self::Error> {
    Ok(match value {
      0 => ColorType::Y,
      2 => ColorType::Rgb,
      3 => ColorType::Index,
      4 => ColorType::Ya,
      6 => ColorType::Rgba,
      _ => return Err(()),
    })
  }
}

/// Why a header was rejected. The text is what goes to `png_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderError {
  Length,
  ZeroWidth,
  ZeroHeight,
  TooWide,
  TooTall,
  BitDepth,
  ColorType,
  Compression,
  Filter,
  Interlace,
}
impl HeaderError {
  pub(crate) const fn message(self) -> &'static str {
    match self {
      Self::Length => "IHDR: invalid length",
      Self::ZeroWidth => "Image width is zero in IHDR",
      Self::ZeroHeight => "Image height is zero in IHDR",
      Self::TooWide => "Image width exceeds user limit in IHDR",
      Self::TooTall => "Image height exceeds user limit in IHDR",
      Self::BitDepth => "Invalid bit depth for color type in IHDR",
      Self::ColorType => "Invalid color type in IHDR",
      Self::Compression => "Unknown compression method in IHDR",
      Self::Filter => "Unknown filter method in IHDR",
      Self::Interlace => "Unknown interlace method in IHDR",
    }
  }
}

/// Image Header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Ihdr {
  pub(crate) width: u32,
  pub(crate) height: u32,
  pub(crate) bit_depth: u8,
  pub(crate) color_type: ColorType,
  pub(crate) is_interlaced: bool,
}
impl Ihdr {
  /// Checks every field the way both the reader and the writer need.
  pub(crate) fn validate(
    width: u32, height: u32, bit_depth: u32, color_type: u32, interlace: u32, compression: u32,
    filter: u32, max_dimension: u32,
  ) -> Result<Self, HeaderError> {
    if width == 0 {
      return Err(HeaderError::ZeroWidth);
    }
    if height == 0 {
      return Err(HeaderError::ZeroHeight);
    }
    // PNG caps both at 2^31-1 regardless of the user limit
    if width > max_dimension || width > i32::MAX as u32 {
      return Err(HeaderError::TooWide);
    }
    if height > max_dimension || height > i32::MAX as u32 {
      return Err(HeaderError::TooTall);
    }
    let color_type = u8::try_from(color_type)
      .ok()
      .and_then(|c| ColorType::try_from(c).ok())
      .ok_or(HeaderError::ColorType)?;
    let bit_depth = match (color_type, bit_depth) {
      (ColorType::Y, 1 | 2 | 4 | 8 | 16) => bit_depth as u8,
      (ColorType::Index, 1 | 2 | 4 | 8) => bit_depth as u8,
      (ColorType::Rgb | ColorType::Ya | ColorType::Rgba, 8 | 16) => bit_depth as u8,
      _ => return Err(HeaderError::BitDepth),
    };
    if compression != PNG_COMPRESSION_TYPE_BASE {
      return Err(HeaderError::Compression);
    }
    if filter != PNG_FILTER_TYPE_BASE {
      return Err(HeaderError::Filter);
    }
    let is_interlaced = match interlace {
      0 => false,
      1 => true,
      _ => return Err(HeaderError::Interlace),
    };
    Ok(Self { width, height, bit_depth, color_type, is_interlaced })
  }

  /// Parses the 13 byte IHDR payload.
  pub(crate) fn parse(data: &[u8], max_dimension: u32) -> Result<Self, HeaderError> {
    match data {
      [w0, w1, w2, w3, h0, h1, h2, h3, bit_depth, color_type, compression, filter, interlace] => {
        Self::validate(
          u32::from_be_bytes([*w0, *w1, *w2, *w3]),
          u32::from_be_bytes([*h0, *h1, *h2, *h3]),
          u32::from(*bit_depth),
          u32::from(*color_type),
          u32::from(*interlace),
          u32::from(*compression),
          u32::from(*filter),
          max_dimension,
        )
      }
      _ => Err(HeaderError::Length),
    }
  }

  pub(crate) fn to_bytes(self) -> [u8; 13] {
    let mut out = [0_u8; 13];
    out[0..4].copy_from_slice(&self.width.to_be_bytes());
    out[4..8].copy_from_slice(&self.height.to_be_bytes());
    out[8] = self.bit_depth;
    out[9] = self.color_type as u8;
    out[12] = self.is_interlaced as u8;
    out
  }

  #[inline]
  pub(crate) const fn bits_per_pixel(&self) -> usize {
    (self.bit_depth as usize) * self.color_type.channel_count()
  }

  /// Filter works on whole bytes: the pixel size rounded up to one byte.
  #[inline]
  pub(crate) const fn filter_bpp(&self) -> usize {
    let bits = self.bits_per_pixel();
    if bits < 8 {
      1
    } else {
      bits / 8
    }
  }

  /// Bytes in one scanline of `width` pixels, not counting the filter byte.
  #[inline]
  pub(crate) const fn bytes_per_scanline(&self, width: u32) -> usize {
    (self.bits_per_pixel() * (width as usize) + 7) / 8
  }

  /// Size of the fully inflated image data, filter bytes included.
  ///
  /// Saturates instead of overflowing, so absurd headers produce a size that
  /// simply fails the memory budget check.
  pub(crate) fn zlib_decompression_requirement(&self) -> usize {
    fn temp_bytes_for_image(ihdr: &Ihdr, width: u32, height: u32) -> usize {
      if width == 0 {
        return 0;
      }
      let bits_per_line: usize = ihdr.bits_per_pixel().saturating_mul(width as usize);
      let bytes_per_scanline: usize = (bits_per_line / 8) + (bits_per_line % 8 != 0) as usize;
      bytes_per_scanline.saturating_add(1).saturating_mul(height as usize)
    }
    if self.is_interlaced {
      reduced_image_dimensions(self.width, self.height)[1..]
        .iter()
        .fold(0_usize, |total, &(w, h)| total.saturating_add(temp_bytes_for_image(self, w, h)))
    } else {
      temp_bytes_for_image(self, self.width, self.height)
    }
  }
}

/// Start and step of each Adam7 pass: `(x0, y0, dx, dy)`.
///
/// ```text
/// 1 6 4 6 2 6 4 6
/// 7 7 7 7 7 7 7 7
/// 5 6 5 6 5 6 5 6
/// 7 7 7 7 7 7 7 7
/// 3 6 4 6 3 6 4 6
/// 7 7 7 7 7 7 7 7
/// 5 6 5 6 5 6 5 6
/// 7 7 7 7 7 7 7 7
/// ```
pub(crate) const ADAM7: [(u32, u32, u32, u32); 7] = [
  (0, 0, 8, 8),
  (4, 0, 8, 8),
  (0, 4, 4, 8),
  (2, 0, 4, 4),
  (0, 2, 2, 4),
  (1, 0, 2, 2),
  (0, 1, 1, 2),
];

/// Dimensions of the reduced images. Index 0 is the full image, 1 through 7
/// are the Adam7 passes.
#[inline]
#[must_use]
pub(crate) const fn reduced_image_dimensions(full_width: u32, full_height: u32) -> [(u32, u32); 8] {
  let mut out = [(full_width, full_height); 8];
  let mut pass = 0;
  while pass < 7 {
    let (x0, y0, dx, dy) = ADAM7[pass];
    let w = if full_width > x0 { (full_width - x0 + dx - 1) / dx } else { 0 };
    let h = if full_height > y0 { (full_height - y0 + dy - 1) / dy } else { 0 };
    out[pass + 1] = (w, h);
    pass += 1;
  }
  out
}

/// Converts a reduced image location into the full image location.
///
/// Level 0 is the full image, where the output equals the input.
#[inline]
#[must_use]
pub(crate) const fn interlaced_pos_to_full_pos(
  image_level: usize, reduced_x: u32, reduced_y: u32,
) -> (u32, u32) {
  if image_level == 0 || image_level > 7 {
    return (reduced_x, reduced_y);
  }
  let (x0, y0, dx, dy) = ADAM7[image_level - 1];
  (reduced_x * dx + x0, reduced_y * dy + y0)
}

/// Whether full-image row `y` has any pixels in Adam7 pass `pass` (0-based).
#[inline]
#[must_use]
pub(crate) const fn pass_has_row(pass: usize, y: u32) -> bool {
  let (_, y0, _, dy) = ADAM7[pass];
  y >= y0 && (y - y0) % dy == 0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_reduced_image_dimensions() {
    assert_eq!(reduced_image_dimensions(0, 0), [(0, 0); 8]);
    // one
    for (w, ex) in (1..=8).zip([1, 1, 1, 1, 1, 1, 1, 1]) {
      assert_eq!(reduced_image_dimensions(w, 0)[1].0, ex, "failed w:{}", w);
    }
    // two
    for (w, ex) in (1..=8).zip([0, 0, 0, 0, 1, 1, 1, 1]) {
      assert_eq!(reduced_image_dimensions(w, 0)[2].0, ex, "failed w:{}", w);
    }
    // three
    for (h, ex) in (1..=8).zip([0, 0, 0, 0, 1, 1, 1, 1]) {
      assert_eq!(reduced_image_dimensions(0, h)[3].1, ex, "failed h: {}", h);
    }
    // four
    for (w, ex) in (1..=8).zip([0, 0, 1, 1, 1, 1, 2, 2]) {
      assert_eq!(reduced_image_dimensions(w, 0)[4].0, ex, "failed w: {}", w);
    }
    // five
    for (h, ex) in (1..=8).zip([0, 0, 1, 1, 1, 1, 2, 2]) {
      assert_eq!(reduced_image_dimensions(0, h)[5].1, ex, "failed h: {}", h);
    }
    // six
    for (w, ex) in (1..=8).zip([0, 1, 1, 2, 2, 3, 3, 4]) {
      assert_eq!(reduced_image_dimensions(w, 0)[6].0, ex, "failed w: {}", w);
    }
    // seven
    for (h, ex) in (1..=8).zip([0, 1, 1, 2, 2, 3, 3, 4]) {
      assert_eq!(reduced_image_dimensions(0, h)[7].1, ex, "failed h: {}", h);
    }
    assert_eq!(
      reduced_image_dimensions(8, 8),
      [(8, 8), (1, 1), (1, 1), (2, 1), (2, 2), (4, 2), (4, 4), (8, 4)]
    );
  }

  #[test]
  fn test_every_pixel_lands_in_exactly_one_pass() {
    let (w, h) = (13, 11);
    let mut hits = vec![0_u8; (w * h) as usize];
    let dims = reduced_image_dimensions(w, h);
    for level in 1..=7 {
      let (rw, rh) = dims[level];
      for ry in 0..rh {
        assert!(pass_has_row(level - 1, interlaced_pos_to_full_pos(level, 0, ry).1));
        for rx in 0..rw {
          let (x, y) = interlaced_pos_to_full_pos(level, rx, ry);
          hits[(y * w + x) as usize] += 1;
        }
      }
    }
    assert!(hits.iter().all(|&n| n == 1));
  }

  #[test]
  fn test_header_validation() {
    let ok = Ihdr::validate(4, 4, 8, 6, 0, 0, 0, 100).unwrap();
    assert_eq!(Ihdr::parse(&ok.to_bytes(), 100), Ok(ok));
    assert_eq!(Ihdr::validate(0, 4, 8, 6, 0, 0, 0, 100), Err(HeaderError::ZeroWidth));
    assert_eq!(Ihdr::validate(4, 101, 8, 6, 0, 0, 0, 100), Err(HeaderError::TooTall));
    assert_eq!(Ihdr::validate(4, 4, 4, 2, 0, 0, 0, 100), Err(HeaderError::BitDepth));
    assert_eq!(Ihdr::validate(4, 4, 8, 5, 0, 0, 0, 100), Err(HeaderError::ColorType));
    assert_eq!(Ihdr::validate(4, 4, 8, 6, 2, 0, 0, 100), Err(HeaderError::Interlace));
    assert_eq!(Ihdr::validate(4, 4, 8, 6, 0, 1, 0, 100), Err(HeaderError::Compression));
    assert_eq!(Ihdr::parse(&[0; 12], 100), Err(HeaderError::Length));
  }

  #[test]
  fn test_zlib_requirement() {
    let ihdr = Ihdr::validate(3, 2, 1, 0, 0, 0, 0, 100).unwrap();
    assert_eq!(ihdr.zlib_decompression_requirement(), 2 * (1 + 1));
    let ihdr = Ihdr::validate(8, 8, 8, 2, 1, 0, 0, 100).unwrap();
    // passes 1..=7 of an 8x8 image, 3 bytes per pixel plus a filter byte a row
    let expected = [(1, 1), (1, 1), (2, 1), (2, 2), (4, 2), (4, 4), (8, 4)]
      .iter()
      .map(|&(w, h)| (w * 3 + 1) * h)
      .sum::<usize>();
    assert_eq!(ihdr.zlib_decompression_requirement(), expected);
  }
}
