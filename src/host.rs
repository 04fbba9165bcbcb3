//! The host application, as the codec sees it.
//!
//! [`FileOp`] is the narrow view of one load or save operation: where the
//! bytes come from or go to, the document being filled in or written out, and
//! the progress, cancel and error signals. [`MemoryFileOp`] is a complete
//! implementation that keeps everything in memory.

use core::cell::RefCell;
use std::{
  fs::File,
  io::{self, BufReader, BufWriter, Cursor, Read, Write},
  path::{Path, PathBuf},
  rc::Rc,
};

use crate::{ColorSpace, Image, PixelFormat, PngOptions, RGB8};

/// One load or save operation in flight.
pub trait FileOp {
  /// The file being loaded or saved.
  fn filename(&self) -> &Path;

  /// Opens the input. By default this opens [`filename`](Self::filename).
  fn open_input(&self) -> io::Result<Box<dyn Read>> {
    Ok(Box::new(BufReader::new(File::open(self.filename())?)))
  }

  /// Creates the output. By default this creates
  /// [`filename`](Self::filename).
  fn open_output(&self) -> io::Result<Box<dyn Write>> {
    Ok(Box::new(BufWriter::new(File::create(self.filename())?)))
  }

  /// Attaches a user-visible error message.
  fn set_error(&mut self, msg: &str);

  /// Creates the image that a load will fill in. `None` if it can't be
  /// allocated.
  fn sequence_image(&mut self, format: PixelFormat, width: u32, height: u32) -> Option<&mut Image>;

  /// The image created by [`sequence_image`](Self::sequence_image).
  fn current_image_mut(&mut self) -> Option<&mut Image>;

  /// The image a save should write.
  fn sequence_image_to_save(&self) -> Option<&Image>;

  fn sequence_set_has_alpha(&mut self, has_alpha: bool);
  fn sequence_get_has_alpha(&self) -> bool;

  /// Resizes the palette.
  fn sequence_set_ncolors(&mut self, ncolors: usize);
  fn sequence_get_ncolors(&self) -> usize;
  fn sequence_set_color(&mut self, index: usize, color: RGB8);
  fn sequence_get_color(&self, index: usize) -> RGB8;
  fn sequence_set_alpha(&mut self, index: usize, alpha: u8);
  fn sequence_get_alpha(&self, index: usize) -> u8;

  /// Reports progress in `0.0..=1.0`.
  fn set_progress(&mut self, progress: f64);
  /// The user asked to cancel.
  fn is_stop(&self) -> bool;

  /// The loaded file carried its own color space.
  fn set_embedded_color_profile(&mut self);
  fn color_space(&self) -> &ColorSpace;
  fn set_color_space(&mut self, color_space: ColorSpace);

  /// The palette index that acts as the transparent "mask" color.
  fn transparent_color(&self) -> u8;
  fn set_transparent_color(&mut self, index: u8);
  /// The document has a background layer and it's visible.
  fn background_layer_visible(&self) -> bool;
  /// The document needs an alpha channel to be saved faithfully.
  fn need_alpha(&self) -> bool;
  fn preserve_color_profile(&self) -> bool;

  fn set_loaded_format_options(&mut self, options: PngOptions);
  fn format_options(&self) -> Option<&PngOptions>;
}

/// A `Write` into a shared byte vector.
#[derive(Debug, Clone, Default)]
pub struct SharedSink(pub Rc<RefCell<Vec<u8>>>);
impl Write for SharedSink {
  #[inline]
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.0.borrow_mut().extend_from_slice(buf);
    Ok(buf.len())
  }
  #[inline]
  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

/// A [`FileOp`] with the whole document in memory.
///
/// Input comes from `input` when it's set and from `path` otherwise. Output
/// goes to `output` when it's set and to `path` otherwise.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileOp {
  pub path: PathBuf,
  pub input: Option<Vec<u8>>,
  pub output: Option<SharedSink>,
  pub image: Option<Image>,
  pub palette: Vec<RGB8>,
  /// One alpha per palette entry.
  pub palette_alpha: Vec<u8>,
  pub has_alpha: bool,
  pub color_space: ColorSpace,
  pub embedded_color_profile: bool,
  pub transparent_color: u8,
  /// Whether there's a visible background layer. Unset means "only when the
  /// document has no alpha".
  pub background_layer: Option<bool>,
  pub preserve_color_profile: bool,
  pub options: Option<PngOptions>,
  /// Every message passed to `set_error`, in order.
  pub errors: Vec<String>,
  pub progress: Vec<f64>,
  /// Reports a stop request once this many progress updates have been made.
  pub cancel_after: Option<usize>,
}
impl MemoryFileOp {
  /// Loads from (and saves to) a file on disk.
  #[must_use]
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into(), preserve_color_profile: true, ..Self::default() }
  }

  /// Loads from bytes already in memory.
  #[must_use]
  pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
    Self { input: Some(bytes.into()), preserve_color_profile: true, ..Self::default() }
  }

  /// Saves `image` into memory. See [`saved_bytes`](Self::saved_bytes).
  #[must_use]
  pub fn to_memory(image: Image) -> Self {
    Self {
      output: Some(SharedSink::default()),
      image: Some(image),
      preserve_color_profile: true,
      ..Self::default()
    }
  }

  /// Everything written so far to the in-memory output.
  #[must_use]
  pub fn saved_bytes(&self) -> Vec<u8> {
    self.output.as_ref().map(|s| s.0.borrow().clone()).unwrap_or_default()
  }

  /// All error messages joined together.
  #[must_use]
  pub fn error(&self) -> String {
    self.errors.join("")
  }
}
impl FileOp for MemoryFileOp {
  fn filename(&self) -> &Path {
    &self.path
  }

  fn open_input(&self) -> io::Result<Box<dyn Read>> {
    match &self.input {
      Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
      None => Ok(Box::new(BufReader::new(File::open(&self.path)?))),
    }
  }

  fn open_output(&self) -> io::Result<Box<dyn Write>> {
    match &self.output {
      Some(sink) => {
        sink.0.borrow_mut().clear();
        Ok(Box::new(sink.clone()))
      }
      None => Ok(Box::new(BufWriter::new(File::create(&self.path)?))),
    }
  }

  fn set_error(&mut self, msg: &str) {
    self.errors.push(msg.to_string());
  }

  fn sequence_image(&mut self, format: PixelFormat, width: u32, height: u32) -> Option<&mut Image> {
    self.image = Some(Image::try_new(format, width, height)?);
    self.image.as_mut()
  }

  fn current_image_mut(&mut self) -> Option<&mut Image> {
    self.image.as_mut()
  }

  fn sequence_image_to_save(&self) -> Option<&Image> {
    self.image.as_ref()
  }

  fn sequence_set_has_alpha(&mut self, has_alpha: bool) {
    self.has_alpha = has_alpha;
  }
  fn sequence_get_has_alpha(&self) -> bool {
    self.has_alpha
  }

  fn sequence_set_ncolors(&mut self, ncolors: usize) {
    self.palette.resize(ncolors, RGB8::default());
    self.palette_alpha.resize(ncolors, 255);
  }
  fn sequence_get_ncolors(&self) -> usize {
    self.palette.len()
  }
  fn sequence_set_color(&mut self, index: usize, color: RGB8) {
    if let Some(c) = self.palette.get_mut(index) {
      *c = color;
    }
  }
  fn sequence_get_color(&self, index: usize) -> RGB8 {
    self.palette.get(index).copied().unwrap_or_default()
  }
  fn sequence_set_alpha(&mut self, index: usize, alpha: u8) {
    if let Some(a) = self.palette_alpha.get_mut(index) {
      *a = alpha;
    }
  }
  fn sequence_get_alpha(&self, index: usize) -> u8 {
    self.palette_alpha.get(index).copied().unwrap_or(255)
  }

  fn set_progress(&mut self, progress: f64) {
    self.progress.push(progress);
  }
  fn is_stop(&self) -> bool {
    self.cancel_after.is_some_and(|n| self.progress.len() >= n)
  }

  fn set_embedded_color_profile(&mut self) {
    self.embedded_color_profile = true;
  }
  fn color_space(&self) -> &ColorSpace {
    &self.color_space
  }
  fn set_color_space(&mut self, color_space: ColorSpace) {
    self.color_space = color_space;
  }

  fn transparent_color(&self) -> u8 {
    self.transparent_color
  }
  fn set_transparent_color(&mut self, index: u8) {
    self.transparent_color = index;
  }
  fn background_layer_visible(&self) -> bool {
    self.background_layer.unwrap_or(!self.has_alpha)
  }
  fn need_alpha(&self) -> bool {
    !self.background_layer_visible()
  }
  fn preserve_color_profile(&self) -> bool {
    self.preserve_color_profile
  }

  fn set_loaded_format_options(&mut self, options: PngOptions) {
    self.options = Some(options);
  }
  fn format_options(&self) -> Option<&PngOptions> {
    self.options.as_ref()
  }
}
