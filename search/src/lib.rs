//! # Agora Search
//!
//! Search indexing processors for the event pipeline: they keep the search
//! store's projection of forum content in sync with domain events.
//!
//! # Idempotence
//!
//! Every indexer recomputes the full [`SearchDocument`] from the system of
//! record and **upserts** it, never patches. Replaying the same event twice
//! therefore yields the same indexed document, which is what at-least-once
//! delivery requires.
//!
//! # Wiring
//!
//! [`search_topology`] describes the queue (topic exchange, catch-all binding,
//! sequential order for last-write-wins) and [`search_router`] builds the
//! event-type dispatch table over the three indexers.

pub mod document;
pub mod indexers;
pub mod pipeline;
pub mod store;

pub use document::{SearchDocument, SearchEntityKind, SearchRole, ViewPolicy};
pub use indexers::{CommentIndexer, DeletionIndexer, TopicIndexer};
pub use pipeline::{search_router, search_topology};
pub use store::{CommentProjection, CommentReader, SearchStore, StoreError, TopicProjection, TopicReader};
