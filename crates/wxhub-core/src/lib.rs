//! Core data types, units, and the persistence contract for wxhub
//!
//! This crate provides the canonical observation every decoder produces,
//! the unit model decoders normalize into, and the sink trait the replay
//! engine publishes through.

pub mod clock;
pub mod enriched;
pub mod observation;
pub mod pipeline;
pub mod units;

pub use clock::*;
pub use enriched::*;
pub use observation::*;
pub use pipeline::*;
pub use units::*;
