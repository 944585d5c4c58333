//! In-memory caches in front of the table stores.
//!
//! [`FeedSnapshotCache`] holds every known feed and remembers when the full
//! set was last loaded; the snapshot is stale once that load is older than
//! the TTL. [`ItemCache`] keeps each feed's items newest first and is stale
//! for a feed when it is empty or its head is older than the feed's
//! `latest_item_published_time`.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::model::{sort_newest_first, Feed, FeedItem};

#[derive(Default)]
struct Snapshot {
    feeds: HashMap<String, Feed>,
    loaded_at: Option<Instant>,
}

pub struct FeedSnapshotCache {
    ttl: Duration,
    inner: RwLock<Snapshot>,
}

impl FeedSnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(Snapshot::default()),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Feed> {
        self.inner.read().await.feeds.get(id).cloned()
    }

    pub async fn find_by_url(&self, url: &str) -> Option<Feed> {
        self.inner
            .read()
            .await
            .feeds
            .values()
            .find(|feed| feed.matches_url(url))
            .cloned()
    }

    /// Insert or replace one feed. Does not refresh the snapshot age.
    pub async fn insert(&self, feed: Feed) {
        self.inner.write().await.feeds.insert(feed.id.clone(), feed);
    }

    pub async fn is_fresh(&self) -> bool {
        self.inner
            .read()
            .await
            .loaded_at
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Drop every cached feed and load `feeds` as the new snapshot.
    pub async fn replace_all(&self, feeds: Vec<Feed>) {
        let mut inner = self.inner.write().await;
        inner.feeds.clear();
        for feed in feeds {
            inner.feeds.insert(feed.id.clone(), feed);
        }
        inner.loaded_at = Some(Instant::now());
    }

    /// Every cached feed ordered by lowercased title, then id.
    pub async fn all(&self) -> Vec<Feed> {
        let mut feeds: Vec<Feed> = self.inner.read().await.feeds.values().cloned().collect();
        feeds.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        feeds
    }
}

#[derive(Default)]
pub struct ItemCache {
    by_feed: RwLock<HashMap<String, Vec<FeedItem>>>,
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_stale(&self, feed_id: &str, latest_published: DateTime<Utc>) -> bool {
        match self.head_time(feed_id).await {
            Some(head) => head < latest_published,
            None => true,
        }
    }

    pub async fn head_time(&self, feed_id: &str) -> Option<DateTime<Utc>> {
        self.by_feed
            .read()
            .await
            .get(feed_id)
            .and_then(|items| items.first())
            .map(|item| item.published_time)
    }

    /// Cached items of a feed, newest first.
    pub async fn items(&self, feed_id: &str) -> Vec<FeedItem> {
        self.by_feed.read().await.get(feed_id).cloned().unwrap_or_default()
    }

    pub async fn find(&self, feed_id: &str, item_id: &str) -> Option<FeedItem> {
        self.by_feed
            .read()
            .await
            .get(feed_id)
            .and_then(|items| items.iter().find(|item| item.id == item_id).cloned())
    }

    pub async fn identity_keys(&self, feed_id: &str) -> HashSet<String> {
        self.by_feed
            .read()
            .await
            .get(feed_id)
            .map(|items| items.iter().map(|i| i.identity_key().to_string()).collect())
            .unwrap_or_default()
    }

    /// Topics already assigned to the feed's items, in first-seen order.
    pub async fn vocabulary(&self, feed_id: &str) -> Vec<String> {
        let by_feed = self.by_feed.read().await;
        let mut seen = HashSet::new();
        let topics: Vec<String> = by_feed
            .get(feed_id)
            .into_iter()
            .flatten()
            .flat_map(|item| item.topics.iter())
            .filter(|topic| seen.insert(topic.as_str()))
            .cloned()
            .collect();
        topics
    }

    /// Merge `incoming` into the feed's items. An incoming item replaces a
    /// cached one with the same identity key.
    pub async fn merge(&self, feed_id: &str, incoming: Vec<FeedItem>) {
        if incoming.is_empty() {
            return;
        }
        let mut by_feed = self.by_feed.write().await;
        let cached = by_feed.remove(feed_id).unwrap_or_default();

        let mut order: Vec<String> = Vec::with_capacity(cached.len() + incoming.len());
        let mut by_key: HashMap<String, FeedItem> = HashMap::new();
        for item in cached.into_iter().chain(incoming) {
            let key = item.identity_key().to_string();
            if by_key.insert(key.clone(), item).is_none() {
                order.push(key);
            }
        }

        let mut merged: Vec<FeedItem> = order.into_iter().filter_map(|key| by_key.remove(&key)).collect();
        sort_newest_first(&mut merged);
        by_feed.insert(feed_id.to_string(), merged);
    }

    /// Remove and return the feed's items published before `cutoff`.
    pub async fn remove_older_than(&self, feed_id: &str, cutoff: DateTime<Utc>) -> Vec<FeedItem> {
        let mut by_feed = self.by_feed.write().await;
        let Some(items) = by_feed.get_mut(feed_id) else {
            return Vec::new();
        };
        let (expired, kept): (Vec<FeedItem>, Vec<FeedItem>) =
            items.drain(..).partition(|item| item.published_time < cutoff);
        *items = kept;
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::item;
    use crate::model::ItemGuid;
    use chrono::Duration as ChronoDuration;

    fn titled(title: &str, id: &str) -> Feed {
        let mut feed = Feed::new(format!("https://example.com/{}", id));
        feed.id = id.to_string();
        feed.title = title.to_string();
        feed
    }

    #[tokio::test]
    async fn test_snapshot_expires_and_is_replaced() {
        let cache = FeedSnapshotCache::new(Duration::from_millis(30));
        assert!(!cache.is_fresh().await);

        cache.replace_all(vec![titled("b", "2"), titled("A", "1")]).await;
        assert!(cache.is_fresh().await);
        let titles: Vec<_> = cache.all().await.into_iter().map(|f| f.title).collect();
        assert_eq!(titles, vec!["A", "b"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cache.is_fresh().await);

        cache.replace_all(vec![titled("c", "3")]).await;
        assert!(cache.get("1").await.is_none());
        assert!(cache.get("3").await.is_some());
    }

    #[tokio::test]
    async fn test_insert_keeps_snapshot_age() {
        let cache = FeedSnapshotCache::new(Duration::from_secs(60));
        cache.insert(titled("x", "1")).await;
        assert!(!cache.is_fresh().await);
        assert!(cache.find_by_url("HTTPS://EXAMPLE.COM/1").await.is_some());
    }

    #[tokio::test]
    async fn test_staleness_follows_feed_head() {
        let cache = ItemCache::new();
        let newest = item("f", "a", ChronoDuration::hours(1));
        assert!(cache.is_stale("f", newest.published_time).await);

        cache.merge("f", vec![newest.clone()]).await;
        assert!(!cache.is_stale("f", newest.published_time).await);
        assert!(cache.is_stale("f", newest.published_time + ChronoDuration::seconds(1)).await);
    }

    #[tokio::test]
    async fn test_merge_dedups_and_sorts() {
        let cache = ItemCache::new();
        let old = item("f", "old", ChronoDuration::hours(5));
        let mid = item("f", "mid", ChronoDuration::hours(3));
        cache.merge("f", vec![old.clone(), mid.clone()]).await;

        let mut summarized = mid.clone();
        summarized.summary = Some("done".to_string());
        let new = item("f", "new", ChronoDuration::hours(1));
        cache.merge("f", vec![summarized, new.clone()]).await;

        let items = cache.items("f").await;
        let keys: Vec<_> = items.iter().map(|i| i.identity_key().to_string()).collect();
        assert_eq!(keys, vec![new.link.clone(), mid.link.clone(), old.link.clone()]);
        assert_eq!(items[1].summary.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_merge_uses_guid_identity() {
        let cache = ItemCache::new();
        let mut a = item("f", "a", ChronoDuration::hours(2));
        let mut b = item("f", "b", ChronoDuration::hours(1));
        let guid = ItemGuid {
            guid: "same".to_string(),
            is_link: false,
        };
        a.guid = Some(guid.clone());
        b.guid = Some(guid);
        cache.merge("f", vec![a]).await;
        cache.merge("f", vec![b.clone()]).await;

        let items = cache.items("f").await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, b.id);
    }

    #[tokio::test]
    async fn test_remove_older_than_and_vocabulary() {
        let cache = ItemCache::new();
        let mut fresh = item("f", "fresh", ChronoDuration::days(1));
        fresh.topics = vec!["rust".to_string(), "async".to_string()];
        let mut expired = item("f", "expired", ChronoDuration::days(9));
        expired.topics = vec!["rust".to_string(), "tokio".to_string()];
        cache.merge("f", vec![fresh.clone(), expired.clone()]).await;

        assert_eq!(cache.vocabulary("f").await, vec!["rust", "async", "tokio"]);

        let removed = cache.remove_older_than("f", Utc::now() - ChronoDuration::days(5)).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, expired.id);
        assert_eq!(cache.items("f").await.len(), 1);
        assert!(cache.remove_older_than("missing", Utc::now()).await.is_empty());
    }
}
