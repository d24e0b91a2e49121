//! Conveyor Core Types
//!
//! Pure types shared by the runtime and its collaborators: identifiers,
//! calendar-aware intervals, and the core error type. No I/O lives here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod interval;

// Re-exports
pub use error::CoreError;
pub use id::{JobId, RunnerId};
pub use interval::{IntervalError, IntervalSpec};
