//! The color space a document is tagged with.

/// PNG stores chromaticities and gamma as integers scaled by 100,000.
const FIXED_SCALE: f64 = 100_000.0;

/// Converts a PNG fixed-point value to a float.
#[inline]
#[must_use]
pub fn fixtof(x: i32) -> f64 {
  f64::from(x) / FIXED_SCALE
}

/// Converts a float to PNG fixed point, rounding to the nearest step.
///
/// Values outside the `i32` range saturate.
#[inline]
#[must_use]
pub fn ftofix(f: f64) -> i32 {
  (f * FIXED_SCALE).round() as i32
}

/// CIE xy chromaticities of the white point and the three primaries.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[allow(missing_docs)]
pub struct Primaries {
  pub wx: f64,
  pub wy: f64,
  pub rx: f64,
  pub ry: f64,
  pub gx: f64,
  pub gy: f64,
  pub bx: f64,
  pub by: f64,
}
impl Primaries {
  /// The sRGB (and Rec. 709) primaries with a D65 white point.
  pub const SRGB: Self = Self {
    wx: 0.3127,
    wy: 0.3290,
    rx: 0.64,
    ry: 0.33,
    gx: 0.30,
    gy: 0.60,
    bx: 0.15,
    by: 0.06,
  };

  /// In the order PNG's `cHRM` chunk uses.
  #[inline]
  #[must_use]
  pub const fn to_array(self) -> [f64; 8] {
    [self.wx, self.wy, self.rx, self.ry, self.gx, self.gy, self.bx, self.by]
  }

  #[inline]
  #[must_use]
  pub const fn from_array([wx, wy, rx, ry, gx, gy, bx, by]: [f64; 8]) -> Self {
    Self { wx, wy, rx, ry, gx, gy, bx, by }
  }
}

/// Used by various image formats that support sRGB colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
// Note: PNG's `sRGB` chunk stores these as 0 through 3 in this order.
pub enum SrgbIntent {
  /// for images preferring good adaptation to the output device gamut at the
  /// expense of colorimetric accuracy, such as photographs.
  Perceptual,
  /// for images requiring colour appearance matching (relative to the output
  /// device white point), such as logos.
  RelativeColorimetric,
  /// for images preferring preservation of saturation at the expense of hue and
  /// lightness, such as charts and graphs.
  Saturation,
  /// for images requiring preservation of absolute colorimetry, such as
  /// previews of images destined for a different output device (proofs).
  AbsoluteColorimetric,
}
impl SrgbIntent {
  #[inline]
  #[must_use]
  pub const fn to_png_value(self) -> u32 {
    self as u32
  }
}

/// Exactly one way of describing a document's colors.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ColorSpace {
  /// Untagged.
  #[default]
  None,
  /// sRGB, optionally with a gamma other than the sRGB curve.
  Srgb { gamma: Option<f64> },
  /// Explicit primaries. Without a gamma the sRGB curve applies.
  Rgb { primaries: Primaries, gamma: Option<f64> },
  /// An embedded ICC profile, kept byte for byte.
  Icc { name: String, profile: Vec<u8> },
}
impl ColorSpace {
  /// Plain sRGB, the PNG default.
  #[inline]
  #[must_use]
  pub const fn srgb() -> Self {
    Self::Srgb { gamma: None }
  }

  #[inline]
  #[must_use]
  pub const fn is_none(&self) -> bool {
    matches!(self, Self::None)
  }

  /// The gamma exponent, if one was given.
  #[inline]
  #[must_use]
  pub fn gamma(&self) -> Option<f64> {
    match self {
      Self::Srgb { gamma } | Self::Rgb { gamma, .. } => *gamma,
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fixed_point_round_trip() {
    for x in [0.0, 0.3127, 0.329, 1.0 / 2.2, 0.45455, 2.2, 1e-5, 21474.0] {
      let back = fixtof(ftofix(x));
      assert!((back - x).abs() <= 1e-5, "{x} came back as {back}");
    }
    assert_eq!(ftofix(0.45455), 45455);
    assert_eq!(fixtof(100_000), 1.0);
    // rounds rather than truncates
    assert_eq!(ftofix(0.000_009), 1);
  }

  #[test]
  fn test_gamma_accessor() {
    assert_eq!(ColorSpace::srgb().gamma(), None);
    assert_eq!(ColorSpace::Srgb { gamma: Some(2.2) }.gamma(), Some(2.2));
    let rgb = ColorSpace::Rgb { primaries: Primaries::SRGB, gamma: Some(1.8) };
    assert_eq!(rgb.gamma(), Some(1.8));
    assert!(ColorSpace::default().is_none());
    assert_eq!(Primaries::from_array(Primaries::SRGB.to_array()), Primaries::SRGB);
  }
}
