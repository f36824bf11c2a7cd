//! STRATA Normalizer - Responses In, Responses Out
//!
//! [`Normalizer`] flattens response trees into records, [`Reader`] rebuilds
//! them, and [`NormalizedStore`] runs both against a tier chain while
//! broadcasting what each write changed.

pub mod normalizer;
pub mod reader;
pub mod store;

pub use normalizer::{Normalizer, RecordBatch};
pub use reader::{to_json, ReadResult, Reader};
pub use store::{NormalizedStore, DEFAULT_CHANGE_CAPACITY};
