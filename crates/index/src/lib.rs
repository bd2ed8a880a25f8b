//! The ad unit index: a document store with term/range filters, partial
//! updates and random scoring. `ElasticIndex` talks to Elasticsearch;
//! `MemoryIndex` evaluates the same queries in-process.

#![warn(clippy::unwrap_used)]

pub mod bootstrap;
pub mod client;
pub mod elastic;
pub mod memory;
pub mod query;

pub use bootstrap::bootstrap_index;
pub use client::{AdIndex, SearchResult};
pub use elastic::ElasticIndex;
pub use memory::MemoryIndex;
pub use query::{Clause, IndexQuery};
