//! Module for pixel formats.
//!
//! The codec can produce many layouts (any bit depth, packed sub-byte
//! samples, 16-bit channels), but the host only ever stores three:
//! * **RGB images** keep one [`RGBA8`] per pixel. An RGB source without alpha
//!   is filled in with `a = 255`, except where a transparent color matches.
//! * **Grayscale images** keep one [`YA8`] per pixel, following the same alpha
//!   rule. Gray is marked as "Y" in format names.
//! * **Indexed images** keep one palette index byte per pixel. The palette
//!   itself (colors as [`RGB8`], plus one alpha per entry) lives beside the
//!   image.
//!
//! ## Bit Depths
//! Everything is 8 bits per channel by the time it reaches the host. The codec
//! keeps the top 8 bits of 16-bit channels, and expands narrow gray samples by
//! using the current bit pattern as the top bits and then copying that bit
//! pattern down until all 8 bits are filled. Narrow palette indexes are just
//! unpacked, one per byte.

use bytemuck::{Pod, Zeroable};

/// An 8-bit gray + alpha pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct YA8 {
  pub y: u8,
  pub a: u8,
}
/// An 8-bit RGB pixel, also the layout of one palette entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct RGB8 {
  pub r: u8,
  pub g: u8,
  pub b: u8,
}
/// An 8-bit RGBA pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct RGBA8 {
  pub r: u8,
  pub g: u8,
  pub b: u8,
  pub a: u8,
}

unsafe impl Zeroable for YA8 {}
unsafe impl Zeroable for RGB8 {}
unsafe impl Zeroable for RGBA8 {}
//
unsafe impl Pod for YA8 {}
unsafe impl Pod for RGB8 {}
unsafe impl Pod for RGBA8 {}

impl YA8 {
  #[inline]
  #[must_use]
  pub const fn new(y: u8, a: u8) -> Self {
    Self { y, a }
  }
}
impl RGB8 {
  #[inline]
  #[must_use]
  pub const fn new(r: u8, g: u8, b: u8) -> Self {
    Self { r, g, b }
  }
}
impl RGBA8 {
  #[inline]
  #[must_use]
  pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
    Self { r, g, b, a }
  }

  /// The color channels, dropping alpha.
  #[inline]
  #[must_use]
  pub const fn rgb(self) -> RGB8 {
    RGB8 { r: self.r, g: self.g, b: self.b }
  }
}
impl From<RGB8> for RGBA8 {
  /// Fully opaque.
  #[inline]
  fn from(RGB8 { r, g, b }: RGB8) -> Self {
    Self { r, g, b, a: 255 }
  }
}

/// How the host stores the pixels of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PixelFormat {
  /// [`RGBA8`] pixels.
  Rgb,
  /// [`YA8`] pixels.
  Grayscale,
  /// `u8` palette indexes.
  Indexed,
}
impl PixelFormat {
  #[inline]
  #[must_use]
  pub const fn bytes_per_pixel(self) -> usize {
    match self {
      Self::Rgb => core::mem::size_of::<RGBA8>(),
      Self::Grayscale => core::mem::size_of::<YA8>(),
      Self::Indexed => 1,
    }
  }
}
