/// Limits for one isolation domain.
///
/// The defaults fit any reasonable PNG while keeping hostile input from
/// pulling unbounded memory into the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainConfig {
  /// Pages of linear memory reserved at creation.
  pub initial_pages: u32,
  /// Pages the linear memory may grow to. At most 65535.
  pub max_pages: u32,
  /// Longest chunk payload the codec will read, in bytes.
  pub max_chunk_size: u32,
  /// Largest accepted width or height, in pixels.
  pub max_dimension: u32,
  /// Longest error message the host will copy out of the domain.
  pub max_message_len: u32,
}
impl Default for DomainConfig {
  #[inline]
  fn default() -> Self {
    Self {
      initial_pages: 16,
      max_pages: 8192,
      max_chunk_size: 32 * 1024 * 1024,
      max_dimension: 1_000_000,
      max_message_len: 256,
    }
  }
}
impl DomainConfig {
  /// Upper bound on the bytes the domain may hold, scratch space included.
  #[inline]
  #[must_use]
  pub const fn memory_budget(&self) -> usize {
    self.max_pages as usize * super::memory::PAGE_SIZE
  }
}
