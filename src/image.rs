#![forbid(unsafe_code)]

//! Provides the heap-allocated image type the host hands to the codec.

use crate::{PixelFormat, RGBA8, YA8};

/// Converts an `(x,y)` position within a given `width` 2D space into a linear
/// index.
///
/// This is how [`Image`] finds the first pixel of a row. If you'd like to use
/// the exact same function it does for some reason, you can.
#[inline]
#[must_use]
pub const fn xy_width_to_index(x: u32, y: u32, width: u32) -> usize {
  (y as usize) * (width as usize) + (x as usize)
}

/// A row-major image in one of the host [`PixelFormat`]s.
///
/// Rows are tightly packed, `width * bytes_per_pixel` bytes each.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Image {
  format: PixelFormat,
  width: u32,
  height: u32,
  data: Vec<u8>,
}
impl Image {
  /// A zeroed image, or `None` if the pixel buffer can't be allocated.
  #[must_use]
  pub fn try_new(format: PixelFormat, width: u32, height: u32) -> Option<Self> {
    let len = (width as usize)
      .checked_mul(height as usize)?
      .checked_mul(format.bytes_per_pixel())?;
    let mut data = Vec::new();
    data.try_reserve_exact(len).ok()?;
    data.resize(len, 0);
    Some(Self { format, width, height, data })
  }

  #[inline]
  #[must_use]
  pub const fn format(&self) -> PixelFormat {
    self.format
  }
  #[inline]
  #[must_use]
  pub const fn width(&self) -> u32 {
    self.width
  }
  #[inline]
  #[must_use]
  pub const fn height(&self) -> u32 {
    self.height
  }

  /// All of the pixel bytes.
  #[inline]
  #[must_use]
  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  #[inline]
  fn row_range(&self, y: u32) -> Option<core::ops::Range<usize>> {
    if y >= self.height {
      return None;
    }
    let bpp = self.format.bytes_per_pixel();
    let start = xy_width_to_index(0, y, self.width) * bpp;
    Some(start..start + self.width as usize * bpp)
  }

  /// The bytes of row `y`, or `None` if it's out of bounds.
  #[inline]
  #[must_use]
  pub fn row(&self, y: u32) -> Option<&[u8]> {
    self.row_range(y).map(|r| &self.data[r])
  }

  #[inline]
  #[must_use]
  pub fn row_mut(&mut self, y: u32) -> Option<&mut [u8]> {
    self.row_range(y).map(move |r| &mut self.data[r])
  }

  /// Row `y` as RGBA pixels. `None` unless the format is [`PixelFormat::Rgb`].
  #[inline]
  #[must_use]
  pub fn rgba_row(&self, y: u32) -> Option<&[RGBA8]> {
    if self.format != PixelFormat::Rgb {
      return None;
    }
    self.row(y).map(bytemuck::cast_slice)
  }

  #[inline]
  #[must_use]
  pub fn rgba_row_mut(&mut self, y: u32) -> Option<&mut [RGBA8]> {
    if self.format != PixelFormat::Rgb {
      return None;
    }
    self.row_mut(y).map(bytemuck::cast_slice_mut)
  }

  /// Row `y` as gray + alpha pixels. `None` unless the format is
  /// [`PixelFormat::Grayscale`].
  #[inline]
  #[must_use]
  pub fn ya_row(&self, y: u32) -> Option<&[YA8]> {
    if self.format != PixelFormat::Grayscale {
      return None;
    }
    self.row(y).map(bytemuck::cast_slice)
  }

  #[inline]
  #[must_use]
  pub fn ya_row_mut(&mut self, y: u32) -> Option<&mut [YA8]> {
    if self.format != PixelFormat::Grayscale {
      return None;
    }
    self.row_mut(y).map(bytemuck::cast_slice_mut)
  }

  /// Gets the pixel bytes at the position, or `None` if the position is out
  /// of bounds.
  #[inline]
  #[must_use]
  pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
    if x >= self.width {
      return None;
    }
    let bpp = self.format.bytes_per_pixel();
    self.row(y).map(|row| &row[x as usize * bpp..(x as usize + 1) * bpp])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rows_are_typed_by_format() {
    let mut img = Image::try_new(PixelFormat::Rgb, 3, 2).unwrap();
    assert_eq!(img.as_bytes().len(), 24);
    img.rgba_row_mut(1).unwrap()[2] = RGBA8::new(1, 2, 3, 4);
    assert_eq!(img.pixel(2, 1), Some(&[1, 2, 3, 4][..]));
    assert!(img.ya_row(0).is_none());
    assert!(img.row(2).is_none());
    assert!(img.pixel(3, 0).is_none());

    let mut gray = Image::try_new(PixelFormat::Grayscale, 2, 2).unwrap();
    gray.ya_row_mut(0).unwrap()[1] = YA8::new(9, 255);
    assert_eq!(gray.row(0), Some(&[0, 0, 9, 255][..]));
  }

  #[test]
  fn test_absurd_sizes_fail_cleanly() {
    assert!(Image::try_new(PixelFormat::Rgb, u32::MAX, u32::MAX).is_none());
  }
}
