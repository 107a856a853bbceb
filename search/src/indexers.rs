//! The indexer processors.
//!
//! Each indexer loads the *current* state of the referenced entity from the
//! system of record, recomputes the full [`SearchDocument`], and upserts it.
//! The envelope's payload is deliberately ignored: trusting a snapshot inside
//! the message would break last-write-wins under redelivery.

use crate::document::{SearchDocument, SearchEntityKind};
use crate::store::{CommentReader, SearchStore, StoreError, TopicReader};
use agora_core::{Envelope, ProcessFuture, ProcessingError, Processor};
use std::sync::Arc;

impl From<StoreError> for ProcessingError {
    fn from(error: StoreError) -> Self {
        match error {
            // A missing entity can never be indexed, no matter how often the
            // event is retried.
            StoreError::NotFound { .. } => Self::Permanent(error.to_string()),
            StoreError::Unavailable(_) => Self::Transient(error.to_string()),
        }
    }
}

/// Reindexes a comment on `new.forum.comment` and `changed.forum.comment`.
pub struct CommentIndexer {
    comments: Arc<dyn CommentReader>,
    store: Arc<dyn SearchStore>,
}

impl CommentIndexer {
    /// Create an indexer over the given collaborators.
    #[must_use]
    pub fn new(comments: Arc<dyn CommentReader>, store: Arc<dyn SearchStore>) -> Self {
        Self { comments, store }
    }
}

impl Processor<Envelope> for CommentIndexer {
    fn process<'a>(&'a self, envelope: &'a Envelope) -> ProcessFuture<'a> {
        Box::pin(async move {
            let comment = self.comments.comment_by_id(envelope.entity_id).await?;
            let document = SearchDocument {
                id: comment.id,
                parent_id: Some(comment.topic_id),
                kind: SearchEntityKind::ForumComment,
                text: comment.text,
                authorized_roles: comment.view_policy.authorized_roles(),
            };
            self.store.upsert(&document).await?;
            tracing::debug!(entity_id = %envelope.entity_id, "Comment reindexed");
            Ok(())
        })
    }
}

/// Reindexes a topic on `new.topic` and `changed.topic`.
pub struct TopicIndexer {
    topics: Arc<dyn TopicReader>,
    store: Arc<dyn SearchStore>,
}

impl TopicIndexer {
    /// Create an indexer over the given collaborators.
    #[must_use]
    pub fn new(topics: Arc<dyn TopicReader>, store: Arc<dyn SearchStore>) -> Self {
        Self { topics, store }
    }
}

impl Processor<Envelope> for TopicIndexer {
    fn process<'a>(&'a self, envelope: &'a Envelope) -> ProcessFuture<'a> {
        Box::pin(async move {
            let topic = self.topics.topic_by_id(envelope.entity_id).await?;
            let document = SearchDocument {
                id: topic.id,
                parent_id: None,
                kind: SearchEntityKind::Topic,
                // Title and body are both searchable.
                text: format!("{}\n{}", topic.title, topic.text),
                authorized_roles: topic.view_policy.authorized_roles(),
            };
            self.store.upsert(&document).await?;
            tracing::debug!(entity_id = %envelope.entity_id, "Topic reindexed");
            Ok(())
        })
    }
}

/// Removes documents on `deleted.topic` and `deleted.forum.comment`.
pub struct DeletionIndexer {
    store: Arc<dyn SearchStore>,
}

impl DeletionIndexer {
    /// Create a deletion handler over the search store.
    #[must_use]
    pub fn new(store: Arc<dyn SearchStore>) -> Self {
        Self { store }
    }
}

impl Processor<Envelope> for DeletionIndexer {
    fn process<'a>(&'a self, envelope: &'a Envelope) -> ProcessFuture<'a> {
        Box::pin(async move {
            self.store.delete(envelope.entity_id).await?;
            tracing::debug!(entity_id = %envelope.entity_id, "Document removed from index");
            Ok(())
        })
    }
}
