//! The domain's private linear memory and the heap that lives inside it.
//!
//! Addresses are plain `u32` offsets from the start of the memory, exactly
//! like a 32-bit wasm module sees them. Every access is bounds checked against
//! the *active* size, so nothing the domain does with an address can reach
//! host memory. Address 0 is never handed out by the heap, which lets 0 keep
//! its usual meaning of "null".

use std::collections::BTreeMap;

use bytemuck::Pod;

use crate::Trap;

/// Linear memory grows in 64 KiB pages.
pub const PAGE_SIZE: usize = 64 * 1024;

/// The first heap address. Everything below is reserved so that small bogus
/// addresses (null plus an offset) always land outside any allocation.
const HEAP_BASE: u32 = 1024;

const ALIGN: u32 = 8;

#[inline]
#[must_use]
const fn align_up(size: u32) -> Option<u32> {
  match size.checked_add(ALIGN - 1) {
    Some(s) => Some(s & !(ALIGN - 1)),
    None => None,
  }
}

/// Isolated linear memory with a first-fit allocator.
pub struct LinearMemory {
  bytes: Vec<u8>,
  max_pages: u32,
  /// start address -> size, for every live allocation.
  live: BTreeMap<u32, u32>,
  /// start address -> size, for every free range. Adjacent ranges are always
  /// merged.
  free: BTreeMap<u32, u32>,
}

impl LinearMemory {
  /// Makes a memory with `initial_pages` active pages, growable up to
  /// `max_pages`.
  pub fn try_new(initial_pages: u32, max_pages: u32) -> Result<Self, String> {
    if initial_pages == 0 {
      return Err("initial memory must be at least one page".into());
    }
    if initial_pages > max_pages {
      return Err(format!("initial pages ({initial_pages}) exceeds maximum ({max_pages})"));
    }
    if (max_pages as u64) * (PAGE_SIZE as u64) > u32::MAX as u64 {
      return Err(format!("{max_pages} pages can't be addressed with 32 bits"));
    }
    let size = initial_pages as usize * PAGE_SIZE;
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(size).map_err(|e| e.to_string())?;
    bytes.resize(size, 0);
    let mut free = BTreeMap::new();
    free.insert(HEAP_BASE, size as u32 - HEAP_BASE);
    Ok(Self { bytes, max_pages, live: BTreeMap::new(), free })
  }

  /// Current number of active pages.
  #[inline]
  #[must_use]
  pub fn page_count(&self) -> u32 {
    (self.bytes.len() / PAGE_SIZE) as u32
  }

  /// Number of allocations that haven't been freed yet.
  #[inline]
  #[must_use]
  pub fn live_allocations(&self) -> usize {
    self.live.len()
  }

  /// Size of the live allocation starting at `addr`, if there is one.
  #[inline]
  #[must_use]
  pub fn allocation_size(&self, addr: u32) -> Option<u32> {
    self.live.get(&addr).copied()
  }

  #[inline]
  fn range(&self, addr: u32, len: u32) -> Result<core::ops::Range<usize>, Trap> {
    let start = addr as usize;
    match start.checked_add(len as usize) {
      Some(end) if end <= self.bytes.len() => Ok(start..end),
      _ => Err(Trap::OutOfBounds { addr, len }),
    }
  }

  /// Borrows `len` bytes starting at `addr`.
  pub fn read(&self, addr: u32, len: u32) -> Result<&[u8], Trap> {
    let r = self.range(addr, len)?;
    Ok(&self.bytes[r])
  }

  /// Mutably borrows `len` bytes starting at `addr`.
  pub fn read_mut(&mut self, addr: u32, len: u32) -> Result<&mut [u8], Trap> {
    let r = self.range(addr, len)?;
    Ok(&mut self.bytes[r])
  }

  /// Copies `data` into memory at `addr`.
  pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Trap> {
    let len = u32::try_from(data.len()).map_err(|_| Trap::OutOfBounds { addr, len: u32::MAX })?;
    self.read_mut(addr, len)?.copy_from_slice(data);
    Ok(())
  }

  /// Loads a plain-data value (no alignment requirement).
  pub fn load<T: Pod>(&self, addr: u32) -> Result<T, Trap> {
    let bytes = self.read(addr, core::mem::size_of::<T>() as u32)?;
    Ok(bytemuck::pod_read_unaligned(bytes))
  }

  /// Stores a plain-data value (no alignment requirement).
  pub fn store<T: Pod>(&mut self, addr: u32, value: T) -> Result<(), Trap> {
    self.write(addr, bytemuck::bytes_of(&value))
  }

  /// Reads a NUL-terminated string of at most `max` bytes (not counting the
  /// terminator). A missing terminator just truncates at `max`.
  pub fn read_c_str(&self, addr: u32, max: u32) -> Result<Vec<u8>, Trap> {
    let available = (self.bytes.len() as u64).saturating_sub(addr as u64);
    if available == 0 {
      return Err(Trap::OutOfBounds { addr, len: 1 });
    }
    let len = (max as u64).min(available) as u32;
    let bytes = self.read(addr, len)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(bytes[..end].to_vec())
  }

  /// Reserves `size` bytes (zero filled) and returns the address.
  pub fn malloc(&mut self, size: u32) -> Result<u32, Trap> {
    let want = align_up(size.max(1)).ok_or(Trap::OutOfMemory { requested: size })?;
    let found = self.free.iter().find(|(_, &len)| len >= want).map(|(&a, &l)| (a, l));
    let (addr, len) = match found {
      Some(hit) => hit,
      None => {
        self.grow_for(want)?;
        self
          .free
          .iter()
          .find(|(_, &len)| len >= want)
          .map(|(&a, &l)| (a, l))
          .ok_or(Trap::OutOfMemory { requested: size })?
      }
    };
    self.free.remove(&addr);
    if len > want {
      self.free.insert(addr + want, len - want);
    }
    self.live.insert(addr, want);
    self.read_mut(addr, want)?.fill(0);
    Ok(addr)
  }

  /// Releases an allocation made by [`malloc`](Self::malloc).
  pub fn free(&mut self, addr: u32) -> Result<(), Trap> {
    let len = self.live.remove(&addr).ok_or(Trap::InvalidFree(addr))?;
    self.insert_free(addr, len);
    Ok(())
  }

  fn insert_free(&mut self, mut addr: u32, mut len: u32) {
    if let Some((&next, &next_len)) = self.free.range(addr..).next() {
      if addr + len == next {
        self.free.remove(&next);
        len += next_len;
      }
    }
    if let Some((&prev, &prev_len)) = self.free.range(..addr).next_back() {
      if prev + prev_len == addr {
        self.free.remove(&prev);
        addr = prev;
        len += prev_len;
      }
    }
    self.free.insert(addr, len);
  }

  fn grow_for(&mut self, want: u32) -> Result<(), Trap> {
    let pages_needed = (want as usize).div_ceil(PAGE_SIZE) as u32;
    let new_pages = self.page_count().checked_add(pages_needed);
    match new_pages {
      Some(p) if p <= self.max_pages => {
        let old_len = self.bytes.len();
        let extra = pages_needed as usize * PAGE_SIZE;
        self.bytes.try_reserve_exact(extra).map_err(|_| Trap::OutOfMemory { requested: want })?;
        self.bytes.resize(old_len + extra, 0);
        self.insert_free(old_len as u32, extra as u32);
        Ok(())
      }
      _ => Err(Trap::OutOfMemory { requested: want }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_malloc_free_coalesces() {
    let mut mem = LinearMemory::try_new(1, 4).unwrap();
    let a = mem.malloc(10).unwrap();
    let b = mem.malloc(100).unwrap();
    let c = mem.malloc(3).unwrap();
    assert!(a >= HEAP_BASE && b > a && c > b);
    assert_eq!(a % ALIGN, 0);
    assert_eq!(mem.live_allocations(), 3);
    mem.free(b).unwrap();
    mem.free(a).unwrap();
    mem.free(c).unwrap();
    assert_eq!(mem.live_allocations(), 0);
    assert_eq!(mem.free.len(), 1);
    assert_eq!(mem.free(c), Err(Trap::InvalidFree(c)));
  }

  #[test]
  fn test_malloc_grows_then_exhausts() {
    let mut mem = LinearMemory::try_new(1, 2).unwrap();
    let big = mem.malloc(PAGE_SIZE as u32).unwrap();
    assert_eq!(mem.page_count(), 2);
    assert!(matches!(mem.malloc(PAGE_SIZE as u32), Err(Trap::OutOfMemory { .. })));
    mem.free(big).unwrap();
  }

  #[test]
  fn test_out_of_bounds_access() {
    let mut mem = LinearMemory::try_new(1, 1).unwrap();
    let end = PAGE_SIZE as u32;
    assert!(mem.read(end - 4, 4).is_ok());
    assert_eq!(mem.read(end - 3, 4), Err(Trap::OutOfBounds { addr: end - 3, len: 4 }));
    assert!(mem.store(u32::MAX, 7_u32).is_err());
    assert!(mem.read_c_str(end, 8).is_err());
  }

  #[test]
  fn test_bad_limits_rejected() {
    assert!(LinearMemory::try_new(0, 1).is_err());
    assert!(LinearMemory::try_new(3, 2).is_err());
    assert!(LinearMemory::try_new(1, 70_000).is_err());
  }
}
