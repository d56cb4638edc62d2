//! Day-boundary replay engine
//!
//! Walks an ordered backlog, then live observations, through the four
//! boundary flags (rollover, midnight, 9am, snow hour) and the running day
//! accumulators, publishing one enriched record per input record.

pub mod accumulators;
pub mod boundary;
pub mod engine;
pub mod live;
pub mod rain;

pub use accumulators::*;
pub use boundary::*;
pub use engine::*;
pub use rain::*;

use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("engine is {0:?} and does not accept records")]
    NotRunning(EngineState),

    #[error("record at {got} is not after {previous}")]
    OutOfOrder {
        previous: NaiveDateTime,
        got: NaiveDateTime,
    },

    #[error("duplicate record at {0}")]
    Duplicate(NaiveDateTime),

    #[error("sink error: {0}")]
    Sink(#[from] anyhow::Error),
}

impl ReplayError {
    /// Errors that only concern the one record being stepped
    pub fn is_record_error(&self) -> bool {
        matches!(self, ReplayError::OutOfOrder { .. } | ReplayError::Duplicate(_))
    }
}

pub type ReplayResult<T> = Result<T, ReplayError>;
