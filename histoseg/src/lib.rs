//! Weakly-supervised semantic segmentation of histology images from patch
//! level tissue-type classifiers.
//!
//! Activation maps of a patch classifier are adjusted per hierarchy, made
//! class specific, refined with a dense CRF and scored against colour-coded
//! annotations.

mod common;

pub mod adjust;
pub mod compose;
pub mod crf;
pub mod error;
pub mod eval;
pub mod gradcam;
pub mod io;
pub mod patch;
pub mod pipeline;
pub mod stitch;
pub mod utils;
pub mod volume;

pub use error::{Error, Result};
