use caged_png::{
  color_space::Primaries, ChunkPlacement, ChunkRecord, CodecError, ColorSpace, DomainConfig,
  EncodeOptions, FormatFlags, Image, MemoryFileOp, PixelFormat, PngFormat, PngOptions, RGB8, RGBA8,
  YA8,
};

const SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

fn crc32(bytes: impl IntoIterator<Item = u8>) -> u32 {
  let mut crc = u32::MAX;
  for b in bytes {
    crc ^= u32::from(b);
    for _ in 0..8 {
      crc = if crc & 1 != 0 { 0xEDB8_8320 ^ (crc >> 1) } else { crc >> 1 };
    }
  }
  crc ^ u32::MAX
}

fn chunk(tag: &[u8; 4], data: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(data.len() + 12);
  out.extend_from_slice(&(data.len() as u32).to_be_bytes());
  out.extend_from_slice(tag);
  out.extend_from_slice(data);
  out.extend_from_slice(&crc32(tag.iter().chain(data).copied()).to_be_bytes());
  out
}

fn ihdr(width: u32, height: u32, depth: u8, color_type: u8, interlace: u8) -> Vec<u8> {
  let mut data = Vec::new();
  data.extend_from_slice(&width.to_be_bytes());
  data.extend_from_slice(&height.to_be_bytes());
  data.extend_from_slice(&[depth, color_type, 0, 0, interlace]);
  chunk(b"IHDR", &data)
}

/// A whole file: the header, then `extra` chunks, then the image data.
fn build_png(header: Vec<u8>, extra: &[Vec<u8>], scanlines: &[u8]) -> Vec<u8> {
  let mut out = SIGNATURE.to_vec();
  out.extend(header);
  for c in extra {
    out.extend_from_slice(c);
  }
  let zlib = miniz_oxide::deflate::compress_to_vec_zlib(scanlines, 6);
  out.extend(chunk(b"IDAT", &zlib));
  out.extend(chunk(b"IEND", &[]));
  out
}

/// Unfiltered scanlines for packed rows of `row_len` bytes.
fn plain_scanlines(rows: &[&[u8]]) -> Vec<u8> {
  rows.iter().flat_map(|r| core::iter::once(0).chain(r.iter().copied())).collect()
}

/// Unfiltered Adam7 scanlines for 8-bit pixels of `bpp` bytes.
fn adam7_scanlines(width: u32, height: u32, bpp: usize, pixels: &[u8]) -> Vec<u8> {
  const PASSES: [(u32, u32, u32, u32); 7] =
    [(0, 0, 8, 8), (4, 0, 8, 8), (0, 4, 4, 8), (2, 0, 4, 4), (0, 2, 2, 4), (1, 0, 2, 2), (0, 1, 1, 2)];
  let mut out = Vec::new();
  for (x0, y0, dx, dy) in PASSES {
    if x0 >= width {
      continue;
    }
    let mut y = y0;
    while y < height {
      out.push(0);
      let mut x = x0;
      while x < width {
        let i = (y * width + x) as usize * bpp;
        out.extend_from_slice(&pixels[i..i + bpp]);
        x += dx;
      }
      y += dy;
    }
  }
  out
}

fn icc_profile(len: usize) -> Vec<u8> {
  let mut p: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
  p[0..4].copy_from_slice(&(len as u32).to_be_bytes());
  p[36..40].copy_from_slice(b"acsp");
  p
}

fn new_format() -> PngFormat {
  PngFormat::create(DomainConfig::default()).unwrap()
}

#[track_caller]
fn assert_clean(format: &PngFormat) {
  let stats = format.sandbox().stats();
  assert!(stats.is_clean(), "{stats:?}");
  assert_eq!(stats.domain_allocations, 0, "{stats:?}");
}

fn save(format: &PngFormat, fop: &mut MemoryFileOp, options: &EncodeOptions) -> Vec<u8> {
  assert!(format.on_save(fop, options), "{}", fop.error());
  assert_clean(format);
  let bytes = fop.saved_bytes();
  assert_eq!(bytes[..8], SIGNATURE);
  bytes
}

fn load(format: &PngFormat, bytes: Vec<u8>) -> MemoryFileOp {
  let mut fop = MemoryFileOp::from_bytes(bytes);
  assert!(format.on_load(&mut fop), "{}", fop.error());
  assert_clean(format);
  fop
}

fn load_err(format: &PngFormat, bytes: Vec<u8>) -> MemoryFileOp {
  let mut fop = MemoryFileOp::from_bytes(bytes);
  assert!(!format.on_load(&mut fop));
  assert!(!fop.error().is_empty());
  assert_clean(format);
  fop
}

fn rgba_image(width: u32, height: u32) -> Image {
  let mut image = Image::try_new(PixelFormat::Rgb, width, height).unwrap();
  for y in 0..height {
    for (x, p) in image.rgba_row_mut(y).unwrap().iter_mut().enumerate() {
      *p = RGBA8::new(x as u8 * 10, (y as u8).wrapping_mul(20), (x + y as usize) as u8, 255 - x as u8);
    }
  }
  image
}

#[test]
fn test_format_description() {
  let format = new_format();
  assert_eq!(format.name(), "png");
  assert_eq!(format.extensions(), "png");
  let flags = format.flags();
  assert!(flags.contains(FormatFlags::LOAD | FormatFlags::SAVE));
  assert!(flags.contains(FormatFlags::INDEXED | FormatFlags::PALETTE_WITH_ALPHA));
  format.destroy();
}

#[test]
fn test_rgba_round_trip() {
  let format = new_format();
  let image = rgba_image(7, 5);
  let mut fop = MemoryFileOp::to_memory(image.clone());
  fop.has_alpha = true;
  let bytes = save(&format, &mut fop, &EncodeOptions::default());
  assert_eq!(fop.progress.last().copied(), Some(1.0));

  let loaded = load(&format, bytes);
  assert!(loaded.has_alpha);
  assert_eq!(loaded.image.as_ref(), Some(&image));
  assert_eq!(loaded.progress.last().copied(), Some(1.0));
}

#[test]
fn test_rgb_without_alpha_is_opaque() {
  let format = new_format();
  let image = rgba_image(4, 3);
  let mut fop = MemoryFileOp::to_memory(image.clone());
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let loaded = load(&format, bytes);
  assert!(!loaded.has_alpha);
  let loaded = loaded.image.unwrap();
  for y in 0..3 {
    let expected: Vec<RGBA8> =
      image.rgba_row(y).unwrap().iter().map(|p| RGBA8::from(p.rgb())).collect();
    assert_eq!(loaded.rgba_row(y).unwrap(), &expected[..]);
  }
}

#[test]
fn test_fix_one_alpha_pixel() {
  let format = new_format();
  let mut image = Image::try_new(PixelFormat::Rgb, 3, 2).unwrap();
  for y in 0..2 {
    image.rgba_row_mut(y).unwrap().fill(RGBA8::new(1, 2, 3, 255));
  }
  let mut fop = MemoryFileOp::to_memory(image);
  let options = EncodeOptions { fix_one_alpha_pixel: true };
  let bytes = save(&format, &mut fop, &options);

  let loaded = load(&format, bytes);
  assert!(loaded.has_alpha);
  let loaded = loaded.image.unwrap();
  assert_eq!(loaded.rgba_row(0).unwrap(), &[RGBA8::new(1, 2, 3, 255); 3]);
  assert_eq!(loaded.rgba_row(1).unwrap()[..2], [RGBA8::new(1, 2, 3, 255); 2]);
  assert_eq!(loaded.rgba_row(1).unwrap()[2], RGBA8::new(1, 2, 3, 254));
}

#[test]
fn test_gray_round_trip() {
  let format = new_format();
  let mut image = Image::try_new(PixelFormat::Grayscale, 6, 2).unwrap();
  for y in 0..2 {
    for (x, p) in image.ya_row_mut(y).unwrap().iter_mut().enumerate() {
      *p = YA8::new((x * 40 + y as usize) as u8, 255);
    }
  }
  let mut fop = MemoryFileOp::to_memory(image.clone());
  let bytes = save(&format, &mut fop, &EncodeOptions::default());
  let loaded = load(&format, bytes);
  assert!(!loaded.has_alpha);
  assert_eq!(loaded.image, Some(image.clone()));

  // with alpha the gray+alpha layout is kept as is
  for (x, p) in image.ya_row_mut(1).unwrap().iter_mut().enumerate() {
    p.a = x as u8;
  }
  let mut fop = MemoryFileOp::to_memory(image.clone());
  fop.has_alpha = true;
  let bytes = save(&format, &mut fop, &EncodeOptions::default());
  let loaded = load(&format, bytes);
  assert!(loaded.has_alpha);
  assert_eq!(loaded.image, Some(image));
}

#[test]
fn test_indexed_round_trip_with_mask() {
  let format = new_format();
  let mut image = Image::try_new(PixelFormat::Indexed, 4, 2).unwrap();
  image.row_mut(0).unwrap().copy_from_slice(&[0, 1, 2, 1]);
  image.row_mut(1).unwrap().copy_from_slice(&[2, 2, 0, 0]);
  let mut fop = MemoryFileOp::to_memory(image.clone());
  fop.palette = vec![RGB8::new(255, 0, 0), RGB8::new(0, 255, 0), RGB8::new(0, 0, 255)];
  fop.palette_alpha = vec![255; 3];
  fop.transparent_color = 1;
  fop.background_layer = Some(false);
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let loaded = load(&format, bytes);
  assert_eq!(loaded.image, Some(image));
  assert_eq!(loaded.palette, fop.palette);
  assert_eq!(loaded.palette_alpha, vec![255, 0, 255]);
  assert_eq!(loaded.transparent_color, 1);
  assert!(loaded.has_alpha);
}

#[test]
fn test_opaque_palette_has_no_alpha() {
  let format = new_format();
  let mut image = Image::try_new(PixelFormat::Indexed, 2, 1).unwrap();
  image.row_mut(0).unwrap().copy_from_slice(&[1, 0]);
  let mut fop = MemoryFileOp::to_memory(image.clone());
  fop.palette = vec![RGB8::new(9, 9, 9), RGB8::new(200, 100, 50)];
  fop.palette_alpha = vec![255; 2];
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let loaded = load(&format, bytes);
  assert_eq!(loaded.image, Some(image));
  assert_eq!(loaded.palette_alpha, vec![255, 255]);
  assert!(!loaded.has_alpha);
}

#[test]
fn test_interlaced_decodes_like_progressive() {
  let format = new_format();
  let (width, height) = (13_u32, 11_u32);
  let pixels: Vec<u8> = (0..width * height * 3).map(|i| (i * 31 % 251) as u8).collect();
  let rows: Vec<&[u8]> = pixels.chunks_exact(width as usize * 3).collect();
  let plain = build_png(ihdr(width, height, 8, 2, 0), &[], &plain_scanlines(&rows));
  let adam7 = build_png(ihdr(width, height, 8, 2, 1), &[], &adam7_scanlines(width, height, 3, &pixels));

  let plain = load(&format, plain);
  let interlaced = load(&format, adam7);
  assert!(plain.image.is_some());
  assert_eq!(plain.image, interlaced.image);
  // seven passes worth of progress
  assert_eq!(interlaced.progress.len(), 7 * height as usize);
  let image = interlaced.image.unwrap();
  let p = &pixels[(width as usize + 2) * 3..][..3];
  assert_eq!(image.pixel(2, 1), Some(&[p[0], p[1], p[2], 255][..]));
}

#[test]
fn test_rgb_transparent_color() {
  let format = new_format();
  let trns = chunk(b"tRNS", &[0, 10, 0, 20, 0, 30]);
  let png = build_png(ihdr(2, 1, 8, 2, 0), &[trns], &plain_scanlines(&[&[10, 20, 30, 1, 2, 3]]));
  let loaded = load(&format, png);
  assert!(loaded.has_alpha);
  let image = loaded.image.unwrap();
  assert_eq!(image.rgba_row(0).unwrap(), &[RGBA8::new(10, 20, 30, 0), RGBA8::new(1, 2, 3, 255)]);
}

#[test]
fn test_out_of_range_transparent_gray_is_ignored() {
  let format = new_format();
  // 300 can't be an 8-bit sample, so nothing is transparent
  let trns = chunk(b"tRNS", &[0x01, 0x2C]);
  let png = build_png(ihdr(3, 1, 8, 0, 0), &[trns], &plain_scanlines(&[&[0, 0x2C, 255]]));
  let loaded = load(&format, png);
  assert!(!loaded.has_alpha);
  let image = loaded.image.unwrap();
  assert_eq!(image.ya_row(0).unwrap(), &[YA8::new(0, 255), YA8::new(0x2C, 255), YA8::new(255, 255)]);

  let trns = chunk(b"tRNS", &[0, 1, 0x01, 0x00, 0, 3]);
  let png = build_png(ihdr(1, 1, 8, 2, 0), &[trns], &plain_scanlines(&[&[1, 0, 3]]));
  let loaded = load(&format, png);
  assert!(!loaded.has_alpha);
  assert_eq!(loaded.image.unwrap().rgba_row(0).unwrap(), &[RGBA8::new(1, 0, 3, 255)]);
}

#[test]
fn test_low_depth_gray_expands() {
  let format = new_format();
  let trns = chunk(b"tRNS", &[0, 1]);
  let png = build_png(ihdr(4, 1, 2, 0, 0), &[trns], &plain_scanlines(&[&[0b00_01_10_11]]));
  let loaded = load(&format, png);
  assert!(loaded.has_alpha);
  let image = loaded.image.unwrap();
  assert_eq!(image.format(), PixelFormat::Grayscale);
  assert_eq!(
    image.ya_row(0).unwrap(),
    &[YA8::new(0, 255), YA8::new(0x55, 0), YA8::new(0xAA, 255), YA8::new(0xFF, 255)]
  );
}

#[test]
fn test_sixteen_bit_is_stripped() {
  let format = new_format();
  let row = [0xAB, 0xCD, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC];
  let png = build_png(ihdr(1, 1, 16, 6, 0), &[], &plain_scanlines(&[&row]));
  let loaded = load(&format, png);
  assert_eq!(loaded.image.unwrap().rgba_row(0).unwrap(), &[RGBA8::new(0xAB, 0x12, 0x56, 0x9A)]);
}

#[test]
fn test_packed_indices_unpack() {
  let format = new_format();
  let plte = chunk(b"PLTE", &[0, 0, 0, 255, 255, 255]);
  let png = build_png(ihdr(10, 1, 1, 3, 0), &[plte], &plain_scanlines(&[&[0xAA, 0x80]]));
  let loaded = load(&format, png);
  assert_eq!(loaded.palette.len(), 2);
  assert_eq!(loaded.image.unwrap().row(0).unwrap(), &[1, 0, 1, 0, 1, 0, 1, 0, 1, 0]);
}

#[test]
fn test_unknown_chunk_round_trip() {
  let format = new_format();
  let mut image = Image::try_new(PixelFormat::Indexed, 2, 2).unwrap();
  image.row_mut(1).unwrap().fill(1);
  let mut options = PngOptions::default();
  options.add_chunk(ChunkRecord {
    name: *b"abcd",
    placement: ChunkPlacement::BeforeImageData,
    data: vec![1, 2, 3],
  });
  let mut fop = MemoryFileOp::to_memory(image);
  fop.palette = vec![RGB8::new(1, 1, 1), RGB8::new(2, 2, 2)];
  fop.palette_alpha = vec![255; 2];
  fop.options = Some(options.clone());
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let loaded = load(&format, bytes);
  assert_eq!(loaded.options, Some(options));
}

#[test]
fn test_unknown_chunk_placements_on_read() {
  let format = new_format();
  let early = chunk(b"abCd", &[9]);
  let mut png = build_png(ihdr(1, 1, 8, 0, 0), &[early], &plain_scanlines(&[&[7]]));
  // one more after the image data, just ahead of IEND
  let iend = png.split_off(png.len() - 12);
  png.extend(chunk(b"zzZz", &[]));
  png.extend(iend);

  let loaded = load(&format, png);
  let options = loaded.options.unwrap();
  let chunks = options.chunks();
  assert_eq!(chunks.len(), 2);
  assert_eq!(chunks[0].name, *b"abCd");
  assert_eq!(chunks[0].placement, ChunkPlacement::BeforePalette);
  assert_eq!(chunks[0].data, vec![9]);
  assert_eq!(chunks[1].name, *b"zzZz");
  assert_eq!(chunks[1].placement, ChunkPlacement::AfterImageData);
  assert!(chunks[1].data.is_empty());
}

#[test]
fn test_no_color_chunks_means_srgb() {
  let format = new_format();
  let png = build_png(ihdr(1, 1, 8, 0, 0), &[], &plain_scanlines(&[&[0]]));
  let loaded = load(&format, png);
  assert_eq!(loaded.color_space, ColorSpace::srgb());
  assert!(!loaded.embedded_color_profile);
}

#[test]
fn test_srgb_round_trip() {
  let format = new_format();
  let mut fop = MemoryFileOp::to_memory(rgba_image(2, 2));
  fop.color_space = ColorSpace::srgb();
  let bytes = save(&format, &mut fop, &EncodeOptions::default());
  let loaded = load(&format, bytes);
  assert!(loaded.embedded_color_profile);
  assert_eq!(loaded.color_space, ColorSpace::srgb());
}

#[test]
fn test_icc_round_trip() {
  let format = new_format();
  let profile = icc_profile(300);
  let mut fop = MemoryFileOp::to_memory(rgba_image(3, 1));
  fop.color_space = ColorSpace::Icc { name: "Display P3".into(), profile: profile.clone() };
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let loaded = load(&format, bytes);
  assert!(loaded.embedded_color_profile);
  assert_eq!(loaded.color_space, ColorSpace::Icc { name: "Display P3".into(), profile });
}

#[test]
fn test_icc_profile_is_not_saved_when_not_preserving() {
  let format = new_format();
  let mut fop = MemoryFileOp::to_memory(rgba_image(3, 1));
  fop.preserve_color_profile = false;
  fop.color_space = ColorSpace::Icc { name: "x".into(), profile: icc_profile(200) };
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let loaded = load(&format, bytes);
  assert!(!loaded.embedded_color_profile);
  assert_eq!(loaded.color_space, ColorSpace::srgb());
}

#[test]
fn test_primaries_and_gamma_round_trip() {
  let format = new_format();
  let mut fop = MemoryFileOp::to_memory(rgba_image(2, 1));
  fop.color_space = ColorSpace::Rgb { primaries: Primaries::SRGB, gamma: Some(2.2) };
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let loaded = load(&format, bytes);
  assert!(loaded.embedded_color_profile);
  match loaded.color_space {
    ColorSpace::Rgb { primaries, gamma } => {
      assert_eq!(primaries, Primaries::SRGB);
      assert!((gamma.unwrap() - 2.2).abs() < 1e-3);
    }
    other => panic!("{other:?}"),
  }
}

#[test]
fn test_gamma_alone_round_trip() {
  let format = new_format();
  let mut fop = MemoryFileOp::to_memory(rgba_image(2, 1));
  fop.color_space = ColorSpace::Srgb { gamma: Some(1.8) };
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let loaded = load(&format, bytes);
  let gamma = loaded.color_space.gamma().unwrap();
  assert!(matches!(loaded.color_space, ColorSpace::Srgb { .. }));
  assert!((gamma - 1.8).abs() < 1e-3);
}

#[test]
fn test_loaded_color_space_does_not_replace_an_existing_one() {
  let format = new_format();
  let mut fop = MemoryFileOp::to_memory(rgba_image(2, 1));
  fop.color_space = ColorSpace::srgb();
  assert!(format.on_save(&mut fop, &EncodeOptions::default()));

  let mut target = MemoryFileOp::from_bytes(fop.saved_bytes());
  target.color_space = ColorSpace::Srgb { gamma: Some(1.0) };
  assert!(format.on_load(&mut target), "{}", target.error());
  assert!(target.embedded_color_profile);
  assert_eq!(target.color_space, ColorSpace::Srgb { gamma: Some(1.0) });
  assert_clean(&format);
}

#[test]
fn test_short_read_is_a_stream_error() {
  let format = new_format();
  let mut fop = MemoryFileOp::to_memory(rgba_image(16, 16));
  fop.has_alpha = true;
  let mut bytes = save(&format, &mut fop, &EncodeOptions::default());
  bytes.truncate(bytes.len() - 20);

  let failed = load_err(&format, bytes.clone());
  assert!(failed.error().contains("read error"), "{}", failed.error());

  let mut fop = MemoryFileOp::from_bytes(bytes);
  match format.load(&mut fop) {
    Err(CodecError::Stream(msg)) => assert!(msg.contains("read error")),
    other => panic!("{other:?}"),
  }
  assert_clean(&format);
}

#[test]
fn test_cancelled_load_stops_early() {
  let format = new_format();
  let mut fop = MemoryFileOp::to_memory(rgba_image(4, 8));
  let bytes = save(&format, &mut fop, &EncodeOptions::default());

  let mut fop = MemoryFileOp::from_bytes(bytes);
  fop.cancel_after = Some(3);
  assert!(format.on_load(&mut fop), "{}", fop.error());
  assert_eq!(fop.progress.len(), 3);
  assert_eq!(fop.image.as_ref().map(Image::height), Some(8));
  assert_clean(&format);

  // the domain is still usable afterwards
  let mut again = MemoryFileOp::from_bytes(fop.input.clone().unwrap());
  assert!(format.on_load(&mut again), "{}", again.error());
  assert_clean(&format);
}

#[test]
fn test_malformed_files_fail_cleanly() {
  let format = new_format();
  let scan = plain_scanlines(&[&[0]]);

  let f = load_err(&format, b"GIF89a not a png at all".to_vec());
  assert!(f.error().contains("Not a PNG file"), "{}", f.error());

  load_err(&format, build_png(ihdr(0, 1, 8, 0, 0), &[], &scan));
  load_err(&format, build_png(ihdr(1, 1, 3, 0, 0), &[], &scan));
  load_err(&format, build_png(ihdr(1, 1, 8, 0, 2), &[], &scan));

  let f = load_err(&format, build_png(ihdr(1, 1, 8, 3, 0), &[], &scan));
  assert!(f.error().contains("Missing PLTE"), "{}", f.error());

  let mut bad_crc = build_png(ihdr(1, 1, 8, 0, 0), &[], &scan);
  bad_crc[8 + 8 + 13] ^= 0xFF;
  let f = load_err(&format, bad_crc);
  assert!(f.error().contains("CRC error"), "{}", f.error());

  let mut hostile_len = SIGNATURE.to_vec();
  hostile_len.extend_from_slice(&0xFFFF_FFF0_u32.to_be_bytes());
  hostile_len.extend_from_slice(b"IHDR");
  hostile_len.extend_from_slice(&[0; 64]);
  load_err(&format, hostile_len);

  let critical = chunk(b"ABCD", &[1]);
  let f = load_err(&format, build_png(ihdr(1, 1, 8, 0, 0), &[critical], &scan));
  assert!(f.error().contains("unknown critical chunk"), "{}", f.error());
}

#[test]
fn test_domain_limits_reject_big_input() {
  let config = DomainConfig { max_chunk_size: 1024, max_dimension: 64, ..DomainConfig::default() };
  let format = PngFormat::create(config).unwrap();
  let scan = plain_scanlines(&[&[0]]);

  let big = chunk(b"teXt", &[b'a'; 2000]);
  let f = load_err(&format, build_png(ihdr(1, 1, 8, 0, 0), &[big], &scan));
  assert!(f.error().contains("too large"), "{}", f.error());

  load_err(&format, build_png(ihdr(65, 1, 8, 0, 0), &[], &scan));
}

#[test]
fn test_random_bytes_never_panic() {
  let format = new_format();
  for _ in 0..25 {
    let mut bytes = SIGNATURE.to_vec();
    bytes.extend(super::rand_bytes(512));
    let mut fop = MemoryFileOp::from_bytes(bytes);
    let _ = format.on_load(&mut fop);
    assert_clean(&format);
  }
  for _ in 0..25 {
    // a valid header followed by garbage image data
    let mut bytes = SIGNATURE.to_vec();
    bytes.extend(ihdr(16, 16, 8, 6, 0));
    bytes.extend(chunk(b"IDAT", &super::rand_bytes(256)));
    bytes.extend(chunk(b"IEND", &[]));
    let mut fop = MemoryFileOp::from_bytes(bytes);
    let _ = format.on_load(&mut fop);
    assert_clean(&format);
  }
}

#[test]
fn test_save_without_image_fails() {
  let format = new_format();
  let mut fop = MemoryFileOp::default();
  fop.output = Some(Default::default());
  assert!(!format.on_save(&mut fop, &EncodeOptions::default()));
  assert!(fop.error().contains("no image"), "{}", fop.error());
  assert_clean(&format);
}

#[test]
fn test_save_and_load_on_disk() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("pic.png");
  let format = new_format();

  let image = rgba_image(9, 4);
  let mut fop = MemoryFileOp::new(&path);
  fop.image = Some(image.clone());
  fop.has_alpha = true;
  assert!(format.on_save(&mut fop, &EncodeOptions::default()), "{}", fop.error());
  assert_eq!(std::fs::read(&path).unwrap()[..8], SIGNATURE);

  let mut loaded = MemoryFileOp::new(&path);
  assert!(format.on_load(&mut loaded), "{}", loaded.error());
  assert_eq!(loaded.image, Some(image));
  assert_clean(&format);

  let mut missing = MemoryFileOp::new(dir.path().join("missing.png"));
  assert!(!format.on_load(&mut missing));
  assert!(!missing.error().is_empty());

  let mut to_dir = MemoryFileOp::new(dir.path());
  to_dir.image = Some(rgba_image(1, 1));
  assert!(!format.on_save(&mut to_dir, &EncodeOptions::default()));
  assert_clean(&format);
}
