//! Settings and side data that travel with a PNG document.

use core::ops::BitOr;

use crate::guest::abi::{PNG_AFTER_IDAT, PNG_HAVE_IHDR, PNG_HAVE_PLTE};

/// Where a preserved chunk sits relative to the critical chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChunkPlacement {
  /// After `IHDR`, before any `PLTE`.
  BeforePalette,
  /// After `PLTE` (if any), before the image data.
  BeforeImageData,
  /// After the image data.
  AfterImageData,
}
impl ChunkPlacement {
  /// The location bit the codec uses for this placement.
  #[inline]
  #[must_use]
  pub const fn to_location(self) -> u32 {
    match self {
      Self::BeforePalette => PNG_HAVE_IHDR,
      Self::BeforeImageData => PNG_HAVE_PLTE,
      Self::AfterImageData => PNG_AFTER_IDAT,
    }
  }

  /// Reads a location bit set. The most significant known bit wins, and an
  /// empty set means right after the header.
  #[inline]
  #[must_use]
  pub const fn from_location(location: u32) -> Self {
    if location & PNG_AFTER_IDAT != 0 {
      Self::AfterImageData
    } else if location & PNG_HAVE_PLTE != 0 {
      Self::BeforeImageData
    } else {
      Self::BeforePalette
    }
  }
}

/// One chunk the codec didn't recognize, kept so it can be written back out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkRecord {
  /// The four tag bytes, eg `b"abcd"`.
  pub name: [u8; 4],
  pub placement: ChunkPlacement,
  pub data: Vec<u8>,
}

/// The format options loaded with (and saved with) a PNG document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PngOptions {
  chunks: Vec<ChunkRecord>,
}
impl PngOptions {
  #[inline]
  pub fn add_chunk(&mut self, chunk: ChunkRecord) {
    self.chunks.push(chunk);
  }

  #[inline]
  #[must_use]
  pub fn chunks(&self) -> &[ChunkRecord] {
    &self.chunks
  }

  #[inline]
  #[must_use]
  pub fn len(&self) -> usize {
    self.chunks.len()
  }

  #[inline]
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.chunks.is_empty()
  }
}

/// Per-call encoder settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EncodeOptions {
  /// Forces alpha output and sets the last pixel's alpha from 255 to 254 when
  /// the last row is opaque up to it. Some viewers ignore the alpha channel of
  /// fully opaque images, and this keeps them from doing so.
  pub fix_one_alpha_pixel: bool,
}

/// What a file format can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FormatFlags(pub u32);
#[allow(missing_docs)]
impl FormatFlags {
  pub const LOAD: Self = Self(1 << 0);
  pub const SAVE: Self = Self(1 << 1);
  pub const RGB: Self = Self(1 << 2);
  pub const RGBA: Self = Self(1 << 3);
  pub const GRAY: Self = Self(1 << 4);
  pub const GRAYA: Self = Self(1 << 5);
  pub const INDEXED: Self = Self(1 << 6);
  pub const SEQUENCES: Self = Self(1 << 7);
  pub const PALETTE_WITH_ALPHA: Self = Self(1 << 8);

  #[inline]
  #[must_use]
  pub const fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }
}
impl BitOr for FormatFlags {
  type Output = Self;
  #[inline]
  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_placement_locations() {
    for p in [
      ChunkPlacement::BeforePalette,
      ChunkPlacement::BeforeImageData,
      ChunkPlacement::AfterImageData,
    ] {
      assert_eq!(ChunkPlacement::from_location(p.to_location()), p);
    }
    assert_eq!(ChunkPlacement::from_location(0), ChunkPlacement::BeforePalette);
    assert_eq!(
      ChunkPlacement::from_location(PNG_HAVE_IHDR | PNG_HAVE_PLTE),
      ChunkPlacement::BeforeImageData
    );
  }

  #[test]
  fn test_flags() {
    let f = FormatFlags::LOAD | FormatFlags::SAVE;
    assert!(f.contains(FormatFlags::LOAD));
    assert!(!f.contains(FormatFlags::RGB));
    assert!(!f.contains(FormatFlags::LOAD | FormatFlags::RGB));
  }
}
