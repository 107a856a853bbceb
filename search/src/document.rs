//! The indexed document shape and the visibility-policy derivation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Roles a search document can be visible to.
///
/// Stored on every document so the query side can filter results by the
/// caller's role without consulting the system of record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchRole {
    /// Visible to everyone, including anonymous readers.
    Everyone,
    /// Registered community members.
    Member,
    /// Forum moderators.
    Moderator,
    /// Site administrators.
    Administrator,
}

/// Visibility policy of the forum an entity belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewPolicy {
    /// Open forum.
    Public,
    /// Members and above.
    MembersOnly,
    /// Moderators and above.
    ModeratorsOnly,
    /// Administrators only.
    AdministratorsOnly,
}

impl ViewPolicy {
    /// The set of roles allowed to see entities under this policy.
    #[must_use]
    pub fn authorized_roles(self) -> BTreeSet<SearchRole> {
        let roles: &[SearchRole] = match self {
            Self::Public => &[SearchRole::Everyone],
            Self::MembersOnly => &[
                SearchRole::Member,
                SearchRole::Moderator,
                SearchRole::Administrator,
            ],
            Self::ModeratorsOnly => &[SearchRole::Moderator, SearchRole::Administrator],
            Self::AdministratorsOnly => &[SearchRole::Administrator],
        };
        roles.iter().copied().collect()
    }
}

/// What kind of entity a search document projects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchEntityKind {
    /// A forum topic.
    Topic,
    /// A comment within a topic.
    ForumComment,
}

/// One document in the search store.
///
/// Recomputed in full on every relevant event; the store keys on `id`, so an
/// upsert of the same id replaces the previous projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    /// Id of the projected entity.
    pub id: Uuid,
    /// Id of the containing entity (topic for a comment), if any.
    pub parent_id: Option<Uuid>,
    /// What kind of entity this document projects.
    pub kind: SearchEntityKind,
    /// Sanitized, searchable text.
    pub text: String,
    /// Roles permitted to see this document in search results.
    pub authorized_roles: BTreeSet<SearchRole>,
}
