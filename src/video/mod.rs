//! Video format primitives shared by capture backends

pub mod format;

pub use format::{PixelFormat, Resolution};
