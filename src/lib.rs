//! One-Cam - camera capture session management
//!
//! This crate drives a camera capture device through its lifecycle and
//! delivers captured frames to a downstream consumer without buffer races.

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod utils;
pub mod video;

pub use error::{CaptureError, Result};
