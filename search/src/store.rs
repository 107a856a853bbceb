//! Collaborator traits: the system of record the indexers read from and the
//! search store they write to.
//!
//! All traits use explicit boxed-future returns so indexers can hold them as
//! trait objects, the same shape as [`agora_core::MessageBroker`].

use crate::document::{SearchDocument, ViewPolicy};
use agora_core::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

/// Errors from the system of record or the search store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The referenced entity does not exist.
    ///
    /// Treated as a permanent failure: retrying an event about a missing
    /// entity can never succeed.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// The entity kind, for the log line.
        entity: &'static str,
        /// The id that was looked up.
        id: Uuid,
    },

    /// The backing service could not be reached or answered with an error.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Current state of a comment, as read from the system of record.
///
/// `text` is already sanitized for indexing; markup processing happens
/// upstream of this pipeline.
#[derive(Clone, Debug)]
pub struct CommentProjection {
    /// Comment id.
    pub id: Uuid,
    /// The topic this comment belongs to.
    pub topic_id: Uuid,
    /// Sanitized comment body.
    pub text: String,
    /// Visibility policy of the containing forum.
    pub view_policy: ViewPolicy,
}

/// Current state of a topic, as read from the system of record.
#[derive(Clone, Debug)]
pub struct TopicProjection {
    /// Topic id.
    pub id: Uuid,
    /// Topic title.
    pub title: String,
    /// Sanitized topic body.
    pub text: String,
    /// Visibility policy of the containing forum.
    pub view_policy: ViewPolicy,
}

/// Reads current comment state from the system of record.
pub trait CommentReader: Send + Sync {
    /// Load the comment with the given id.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no such comment exists,
    /// [`StoreError::Unavailable`] on transport failure.
    fn comment_by_id(&self, id: Uuid) -> BoxFuture<'_, Result<CommentProjection, StoreError>>;
}

/// Reads current topic state from the system of record.
pub trait TopicReader: Send + Sync {
    /// Load the topic with the given id.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no such topic exists,
    /// [`StoreError::Unavailable`] on transport failure.
    fn topic_by_id(&self, id: Uuid) -> BoxFuture<'_, Result<TopicProjection, StoreError>>;
}

/// The search store the indexers write to.
pub trait SearchStore: Send + Sync {
    /// Insert or fully replace the document with the same id.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] on transport failure.
    fn upsert<'a>(&'a self, document: &'a SearchDocument) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Remove the document with the given id. Removing an absent document is
    /// a no-op, which keeps deletion idempotent.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] on transport failure.
    fn delete(&self, id: Uuid) -> BoxFuture<'_, Result<(), StoreError>>;
}
