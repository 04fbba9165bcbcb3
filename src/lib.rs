#![cfg_attr(docs_rs, feature(doc_cfg))]
//#![warn(missing_docs)]

//! PNG loading and saving, with the codec confined to an isolation domain.
//!
//! The codec in [`guest`] parses and writes PNG bytes, and it only runs
//! against the private linear memory of a [`Sandbox`]. The host side
//! ([`PngFormat`]) never shares memory with it: arguments are `u32` scalars,
//! buffers are allocated inside the domain and copied across explicitly, and
//! everything that comes back is [`Tainted`] until it has been verified.
//!
//! ```no_run
//! use caged_png::{DomainConfig, MemoryFileOp, PngFormat};
//!
//! let format = PngFormat::create(DomainConfig::default()).unwrap();
//! let mut fop = MemoryFileOp::new("image.png");
//! if format.on_load(&mut fop) {
//!   let image = fop.image.as_ref().unwrap();
//!   println!("{}x{}", image.width(), image.height());
//! } else {
//!   println!("{}", fop.error());
//! }
//! ```

#[cfg(target_pointer_width = "16")]
compile_error!("this crate assumes 32-bit or bigger pointers!");

mod error;
pub use error::*;

pub mod pixel_formats;
pub use pixel_formats::*;

pub mod image;
pub use image::*;

pub mod color_space;
pub use color_space::ColorSpace;

pub mod options;
pub use options::*;

pub mod host;
pub use host::{FileOp, MemoryFileOp};

pub mod sandbox;
pub use sandbox::{BoundaryStats, DomainConfig, Sandbox, Tainted, TaintedPtr};

pub mod guest;

pub mod png_format;
pub use png_format::PngFormat;
