//! Queue wiring for the search indexing pipeline.

use crate::indexers::{CommentIndexer, DeletionIndexer, TopicIndexer};
use crate::store::{CommentReader, SearchStore, TopicReader};
use agora_core::{EventType, ExchangeKind, ProcessingOrder, QueueTopology};
use agora_runtime::EventRouter;
use std::sync::Arc;

/// Topology of the search indexing queue.
///
/// Topic exchange with a catch-all binding: the indexers decide relevance by
/// event type, not by routing key. Sequential order is required: projections
/// are last-write-wins, so E1 must never be applied after E2.
#[must_use]
pub fn search_topology() -> QueueTopology {
    QueueTopology::builder("agora.events", "agora.search.indexing")
        .exchange_kind(ExchangeKind::Topic)
        .routing_keys(["#"])
        .processing_order(ProcessingOrder::Sequential)
        .build()
}

/// Build the full indexing dispatch table.
///
/// Creation and change events share one indexer per entity kind; both
/// deletion events share the [`DeletionIndexer`].
#[must_use]
pub fn search_router(
    comments: Arc<dyn CommentReader>,
    topics: Arc<dyn TopicReader>,
    store: Arc<dyn SearchStore>,
) -> EventRouter {
    let comment_indexer = Arc::new(CommentIndexer::new(comments, Arc::clone(&store)));
    let topic_indexer = Arc::new(TopicIndexer::new(topics, Arc::clone(&store)));
    let deletion_indexer = Arc::new(DeletionIndexer::new(store));

    EventRouter::builder()
        .register(EventType::NewForumComment, Arc::clone(&comment_indexer) as _)
        .register(EventType::ChangedForumComment, comment_indexer as _)
        .register(EventType::NewTopic, Arc::clone(&topic_indexer) as _)
        .register(EventType::ChangedTopic, topic_indexer as _)
        .register(EventType::DeletedForumComment, Arc::clone(&deletion_indexer) as _)
        .register(EventType::DeletedTopic, deletion_indexer as _)
        .build()
}
