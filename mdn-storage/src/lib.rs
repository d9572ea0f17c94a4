//! Storage-facing interfaces and the in-memory data layer.

pub mod data_layer;
pub mod memory;
pub mod snapshot;

pub use data_layer::{DataLayer, ReadOutcome, Row};
pub use memory::MemoryDataLayer;
