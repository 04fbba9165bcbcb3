//! The calling convention between the host and the codec module.
//!
//! Everything here is shared by both sides of the boundary, the same way a C
//! header would be: the export table, the layout of the structs that get
//! passed by address, and the flag values.

use bytemuck::{Pod, Zeroable};

/// Version string the module was built from. `png_create_*_struct` refuses
/// callers built against a different major.minor.
pub const LIBPNG_VER_STRING: &str = "1.6.43";

pub const PNG_COLOR_TYPE_GRAY: u32 = 0;
pub const PNG_COLOR_TYPE_RGB: u32 = 2;
pub const PNG_COLOR_TYPE_PALETTE: u32 = 3;
pub const PNG_COLOR_TYPE_GRAY_ALPHA: u32 = 4;
pub const PNG_COLOR_TYPE_RGB_ALPHA: u32 = 6;

pub const PNG_INTERLACE_NONE: u32 = 0;
pub const PNG_INTERLACE_ADAM7: u32 = 1;
pub const PNG_COMPRESSION_TYPE_BASE: u32 = 0;
pub const PNG_FILTER_TYPE_BASE: u32 = 0;

pub const PNG_MAX_PALETTE_LENGTH: usize = 256;
pub const PNG_SRGB_INTENT_PERCEPTUAL: u32 = 0;

// `png_get_valid` flags.
pub const PNG_INFO_GAMA: u32 = 0x0001;
pub const PNG_INFO_CHRM: u32 = 0x0004;
pub const PNG_INFO_PLTE: u32 = 0x0008;
pub const PNG_INFO_TRNS: u32 = 0x0010;
pub const PNG_INFO_SRGB: u32 = 0x0800;
pub const PNG_INFO_ICCP: u32 = 0x1000;

// Where an unknown chunk sits relative to the critical chunks.
pub const PNG_HAVE_IHDR: u32 = 0x01;
pub const PNG_HAVE_PLTE: u32 = 0x02;
pub const PNG_AFTER_IDAT: u32 = 0x08;

/// An unknown chunk, as laid out in domain memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct UnknownChunkRaw {
  /// Four tag bytes followed by a NUL and padding.
  pub name: [u8; 8],
  pub data: u32,
  pub size: u32,
  pub location: u32,
}

/// A 16-bit-per-channel color, as laid out in domain memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Color16Raw {
  pub index: u8,
  pub pad: u8,
  pub red: u16,
  pub green: u16,
  pub blue: u16,
  pub gray: u16,
}

macro_rules! exports {
  ($($variant:ident = $name:literal / $arity:literal,)*) => {
    /// A function exported by the codec module.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[allow(missing_docs)]
    pub enum Export {
      $($variant,)*
    }
    impl Export {
      /// The symbol name.
      #[inline]
      #[must_use]
      pub const fn name(self) -> &'static str {
        match self {
          $(Self::$variant => $name,)*
        }
      }
      /// How many arguments the export takes.
      #[inline]
      #[must_use]
      pub const fn arity(self) -> usize {
        match self {
          $(Self::$variant => $arity,)*
        }
      }
    }
  };
}

exports! {
  Malloc = "malloc" / 1,
  Free = "free" / 1,
  CreateReadStruct = "png_create_read_struct" / 1,
  CreateWriteStruct = "png_create_write_struct" / 1,
  CreateInfoStruct = "png_create_info_struct" / 1,
  DestroyReadStruct = "png_destroy_read_struct" / 2,
  DestroyWriteStruct = "png_destroy_write_struct" / 2,
  Error = "png_error" / 2,
  GetErrorMessage = "png_get_error_message" / 2,
  GetIoPtr = "png_get_io_ptr" / 1,
  GetUserChunkPtr = "png_get_user_chunk_ptr" / 1,
  SetReadFn = "png_set_read_fn" / 3,
  SetWriteFn = "png_set_write_fn" / 3,
  SetReadUserChunkFn = "png_set_read_user_chunk_fn" / 3,
  ReadInfo = "png_read_info" / 2,
  GetIHDR = "png_get_IHDR" / 7,
  SetStrip16 = "png_set_strip_16" / 1,
  SetPacking = "png_set_packing" / 1,
  SetExpandGray1248 = "png_set_expand_gray_1_2_4_to_8" / 1,
  SetInterlaceHandling = "png_set_interlace_handling" / 1,
  ReadUpdateInfo = "png_read_update_info" / 2,
  GetImageWidth = "png_get_image_width" / 2,
  GetImageHeight = "png_get_image_height" / 2,
  GetRowbytes = "png_get_rowbytes" / 2,
  GetColorType = "png_get_color_type" / 2,
  GetPLTE = "png_get_PLTE" / 4,
  GetTRNS = "png_get_tRNS" / 5,
  GetValid = "png_get_valid" / 3,
  GetICCP = "png_get_iCCP" / 6,
  GetCHRMFixed = "png_get_cHRM_fixed" / 10,
  GetGAMAFixed = "png_get_gAMA_fixed" / 3,
  ReadRow = "png_read_row" / 3,
  ReadEnd = "png_read_end" / 2,
  SetIHDR = "png_set_IHDR" / 9,
  SetPLTE = "png_set_PLTE" / 4,
  SetTRNS = "png_set_tRNS" / 5,
  SetICCP = "png_set_iCCP" / 6,
  SetSRGB = "png_set_sRGB" / 3,
  SetCHRMFixed = "png_set_cHRM_fixed" / 10,
  SetGAMAFixed = "png_set_gAMA_fixed" / 3,
  SetUnknownChunks = "png_set_unknown_chunks" / 4,
  WriteInfo = "png_write_info" / 2,
  WriteRow = "png_write_row" / 2,
  WriteEnd = "png_write_end" / 2,
}
