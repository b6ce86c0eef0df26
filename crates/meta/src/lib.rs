//! Durable metadata for index builds
//!
//! - Catalog: key scheme and encoding of Index / SegmentIndex rows
//! - MetaTable: in-memory mirror with write-through persistence, the index
//!   state machine and soft-delete rules

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod meta_table;

pub use catalog::{index_key, segment_index_key, Catalog, INDEX_PREFIX, SEGMENT_INDEX_PREFIX};
pub use meta_table::{MetaTable, StateUpdate};
