//! Chunk framing: tags, CRC, and serialization.

pub(crate) const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

pub(crate) const IHDR: [u8; 4] = *b"IHDR";
pub(crate) const PLTE: [u8; 4] = *b"PLTE";
pub(crate) const IDAT: [u8; 4] = *b"IDAT";
pub(crate) const IEND: [u8; 4] = *b"IEND";
pub(crate) const TRNS: [u8; 4] = *b"tRNS";
pub(crate) const GAMA: [u8; 4] = *b"gAMA";
pub(crate) const CHRM: [u8; 4] = *b"cHRM";
pub(crate) const SRGB: [u8; 4] = *b"sRGB";
pub(crate) const ICCP: [u8; 4] = *b"iCCP";

/// Chunks the codec handles itself. Anything else goes to the unknown chunk
/// path.
pub(crate) const KNOWN: [[u8; 4]; 9] = [IHDR, PLTE, IDAT, IEND, TRNS, GAMA, CHRM, SRGB, ICCP];

/// Critical chunks have an uppercase first letter.
#[inline]
#[must_use]
pub(crate) const fn is_critical(tag: [u8; 4]) -> bool {
  (tag[0] & 32) == 0
}

/// Chunk tags are four ASCII letters.
#[inline]
#[must_use]
pub(crate) fn is_valid_tag(tag: [u8; 4]) -> bool {
  tag.iter().all(u8::is_ascii_alphabetic)
}

/// Printable form of a tag for messages.
pub(crate) fn tag_str(tag: [u8; 4]) -> String {
  tag.iter().map(|&b| if b.is_ascii_graphic() { b as char } else { '?' }).collect()
}

const CRC_TABLE: [u32; 256] = make_crc_table();

const fn make_crc_table() -> [u32; 256] {
  let mut out = [0; 256];
  let mut n = 0;
  while n < 256 {
    let mut c = n as u32;
    let mut k = 0;
    while k < 8 {
      if (c & 1) != 0 {
        c = 0xEDB8_8320_u32 ^ (c >> 1);
      } else {
        c >>= 1;
      }
      k += 1;
    }
    out[n] = c;
    n += 1;
  }
  out
}

fn update_crc(mut crc: u32, iter: impl Iterator<Item = u8>) -> u32 {
  for byte in iter {
    let i = (crc ^ u32::from(byte)) as u8 as usize;
    crc = CRC_TABLE[i] ^ (crc >> 8);
  }
  crc
}

/// CRC-32 over the tag and the payload, as stored after every chunk.
#[inline]
#[must_use]
pub(crate) fn chunk_crc(tag: [u8; 4], data: &[u8]) -> u32 {
  update_crc(u32::MAX, tag.iter().copied().chain(data.iter().copied())) ^ u32::MAX
}

/// Length, tag, payload and CRC, ready to write out.
pub(crate) fn serialize(tag: [u8; 4], data: &[u8]) -> Option<Vec<u8>> {
  let len = u32::try_from(data.len()).ok().filter(|&l| l <= i32::MAX as u32)?;
  let mut out = Vec::with_capacity(data.len() + 12);
  out.extend_from_slice(&len.to_be_bytes());
  out.extend_from_slice(&tag);
  out.extend_from_slice(data);
  out.extend_from_slice(&chunk_crc(tag, data).to_be_bytes());
  Some(out)
}
