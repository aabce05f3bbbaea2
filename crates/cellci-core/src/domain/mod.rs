//! Domain models for cellci.
//!
//! - `Event` / `EventKind`: what happens inside a cell run
//! - `CellciError`: the domain error taxonomy

pub mod error;
pub mod run;

pub use error::{CellciError, Result};
pub use run::{Event, EventKind};
