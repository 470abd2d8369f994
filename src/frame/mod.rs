//! Raw frames: header reading, semantic tags and classification.
//!
//! This module owns everything that turns files on disk into tagged frames:
//! - FITS primary-header parsing and keyword mapping (HeaderSource)
//! - the closed Tag set
//! - the classification rules

pub mod classify;
pub mod fits;
pub mod raw;
pub mod tag;

pub use classify::{Classifier, discover_frames};
pub use fits::{FitsHeaders, HeaderSource};
pub use raw::{InstrumentSetup, RawFrame};
pub use tag::Tag;
