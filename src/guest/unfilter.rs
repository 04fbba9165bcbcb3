//! Undoing (and trivially applying) the per-scanline byte filters.

#[inline]
#[must_use]
const fn paeth_predict(a: u8, b: u8, c: u8) -> u8 {
  let a_ = a as i32;
  let b_ = b as i32;
  let c_ = c as i32;
  let p: i32 = a_ + b_ - c_;
  let pa = (p - a_).abs();
  let pb = (p - b_).abs();
  let pc = (p - c_).abs();
  // the order of these tests is fixed by the format
  if pa <= pb && pa <= pc {
    a
  } else if pb <= pc {
    b
  } else {
    c
  }
}

/// A filter type byte that isn't 0 through 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BadFilter(pub(crate) u8);

/// Unfilters `row` in place.
///
/// `prev` is the already unfiltered previous row of the same reduced image,
/// or empty for the first row (which then behaves as a row of zeros).
/// `bpp` is the filter unit: bytes per pixel, rounded up to 1.
pub(crate) fn unfilter_row(filter: u8, row: &mut [u8], prev: &[u8], bpp: usize) -> Result<(), BadFilter> {
  let up = |i: usize| prev.get(i).copied().unwrap_or(0);
  match filter {
    0 => (),
    1 => {
      for i in bpp..row.len() {
        row[i] = row[i].wrapping_add(row[i - bpp]);
      }
    }
    2 => {
      for (i, b) in row.iter_mut().enumerate() {
        *b = b.wrapping_add(up(i));
      }
    }
    3 => {
      for i in 0..row.len() {
        let left = if i >= bpp { row[i - bpp] } else { 0 };
        let avg = ((u16::from(left) + u16::from(up(i))) / 2) as u8;
        row[i] = row[i].wrapping_add(avg);
      }
    }
    4 => {
      for i in 0..row.len() {
        let (left, up_left) = if i >= bpp { (row[i - bpp], up(i - bpp)) } else { (0, 0) };
        row[i] = row[i].wrapping_add(paeth_predict(left, up(i), up_left));
      }
    }
    other => return Err(BadFilter(other)),
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_paeth_predict() {
    assert_eq!(paeth_predict(10, 20, 10), 20);
    assert_eq!(paeth_predict(20, 10, 10), 20);
    assert_eq!(paeth_predict(0, 0, 0), 0);
    assert_eq!(paeth_predict(5, 9, 200), 5);
  }

  #[test]
  fn test_unfilter_each_type() {
    let prev = [10_u8, 20, 30, 40];

    let mut row = [1_u8, 2, 3, 4];
    unfilter_row(1, &mut row, &prev, 2).unwrap();
    assert_eq!(row, [1, 2, 4, 6]);

    let mut row = [1_u8, 2, 3, 4];
    unfilter_row(2, &mut row, &prev, 2).unwrap();
    assert_eq!(row, [11, 22, 33, 44]);

    let mut row = [1_u8, 2, 3, 4];
    unfilter_row(3, &mut row, &prev, 1).unwrap();
    // 1+5, 2+(6+20)/2, 3+(15+30)/2, 4+(25+40)/2
    assert_eq!(row, [6, 15, 25, 36]);

    let mut row = [1_u8, 2, 3, 4];
    unfilter_row(2, &mut row, &[], 1).unwrap();
    assert_eq!(row, [1, 2, 3, 4]);

    let mut row = [1_u8, 1];
    unfilter_row(4, &mut row, &[], 1).unwrap();
    assert_eq!(row, [1, 2]);

    assert_eq!(unfilter_row(5, &mut [0], &[], 1), Err(BadFilter(5)));
  }
}
