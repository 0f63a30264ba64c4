//! Internal utilities.

mod det_rng;

pub use det_rng::{derive_stream, DetRng};
