//! Format conversion between decoder output and what the session hands out.
//!
//! - [`PixelConverter`] - native pixel formats to the RGBA [`crate::Picture`]
//! - [`SampleConverter`] - native sample layout to the interleaved FIFO format

mod picture;
mod samples;

pub use picture::{ColorSpace, PixelConverter};
pub use samples::SampleConverter;
