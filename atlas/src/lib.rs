//! Tissue-type taxonomy: hierarchies, class lists, colour tables and the
//! declarative adjustment rules attached to each hierarchy.

mod common;

pub use atlas::*;
pub mod atlas;

pub use colour::*;
pub mod colour;

pub use htt::*;
pub mod htt;

pub use rule::*;
pub mod rule;
