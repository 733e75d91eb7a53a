use crate::storage::{DatabaseError, Entry};

/// Which feeds a lookup searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope<'a> {
    /// Entries of one feed.
    Feed(i64),
    /// Entries of every feed.
    Any,
    /// Entries of the listed feeds. An empty list matches nothing.
    Among(&'a [i64]),
}

/// Hash lookups the deduplicator needs from persistence.
///
/// Implementations return the oldest matching entry, if any.
#[allow(async_fn_in_trait)]
pub trait EntryLookup {
    async fn find_by_link_hash(
        &mut self,
        link_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError>;

    async fn find_by_title_hash(
        &mut self,
        title_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError>;

    async fn find_by_content_hash(
        &mut self,
        content_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError>;

    /// A single entry matching both hashes.
    async fn find_by_title_and_content(
        &mut self,
        title_hash: &str,
        content_hash: &str,
        scope: FeedScope<'_>,
    ) -> Result<Option<Entry>, DatabaseError>;
}
