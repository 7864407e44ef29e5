#![deny(missing_docs)]
#![doc = "Shared identifiers, error types and deterministic randomness for the DPM site-clustering engine."]

pub mod errors;
pub mod rng;
mod types;

pub use errors::{DpmError, ErrorInfo};
pub use rng::{derive_substream_seed, RngHandle};
pub use types::{ClusterId, ParameterId};
