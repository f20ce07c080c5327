//! Storage seams: blobs, document metadata and run progress.
//!
//! Each concern is an `async_trait` so a deployment can back it with S3, a
//! relational database or Redis. In-memory and local-filesystem
//! implementations ship with the crate.

pub mod documents;
pub mod object;
pub mod progress;

pub use documents::{DocumentStore, MemoryDocumentStore};
pub use object::{get_json, put_json, LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use progress::{
    Counter, MarkOutcome, MarkResult, MemoryProgressStore, PagePlan, ProgressStore, Remaining,
};
