//! Feed manager: subscriptions, item retrieval and the refresh pipeline.
//!
//! Reads go through [`FeedSnapshotCache`] and [`ItemCache`] before touching
//! the table stores. A refresh fetches and parses the feed document, stores
//! new items (summarized when an LLM is configured), applies retention and
//! persists the updated feed metadata.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{FeedSnapshotCache, ItemCache};
use crate::error::{FeedscopeError, Result};
use crate::ingestion::FeedFetcher;
use crate::llm::remote::DEFAULT_MAX_TOKENS;
use crate::llm::summarizer::{extract_topics, summarize_item};
use crate::llm::LlmProvider;
use crate::model::{paginate, sort_newest_first, Feed, FeedItem, FEEDS_PARTITION};
use crate::parser::parse_feed;
use crate::storage::{open_table_store, Comparison, FieldFilter, TableStore};

pub struct FeedStore {
    feeds: Arc<dyn TableStore<Feed>>,
    items: Arc<dyn TableStore<FeedItem>>,
    fetcher: FeedFetcher,
    llm: Option<Arc<dyn LlmProvider>>,
    feed_cache: FeedSnapshotCache,
    item_cache: ItemCache,
    retention: ChronoDuration,
    summary_max_tokens: usize,
}

impl FeedStore {
    pub fn new(
        feeds: Arc<dyn TableStore<Feed>>,
        items: Arc<dyn TableStore<FeedItem>>,
        fetcher: FeedFetcher,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            feeds,
            items,
            fetcher,
            llm,
            feed_cache: FeedSnapshotCache::new(Duration::from_secs(common::DEFAULT_FEED_SNAPSHOT_TTL_SECS)),
            item_cache: ItemCache::new(),
            retention: ChronoDuration::days(common::DEFAULT_RETENTION_DAYS as i64),
            summary_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention = ChronoDuration::days(days as i64);
        self
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.feed_cache = FeedSnapshotCache::new(ttl);
        self
    }

    /// Open both tables, build the fetcher and apply the configured
    /// retention and cache settings.
    pub fn from_config(config: &common::Config, llm: Option<Arc<dyn LlmProvider>>) -> Result<Self> {
        let feeds = open_table_store::<Feed>(config, &config.feeds_table())?;
        let items = open_table_store::<FeedItem>(config, &config.items_table())?;
        let fetcher = FeedFetcher::from_config(config)?;

        let mut store = Self::new(feeds, items, fetcher, llm)
            .with_retention_days(config.retention_days())
            .with_snapshot_ttl(config.feed_snapshot_ttl());
        if let Some(max_tokens) = config.llm.as_ref().and_then(|l| l.max_tokens) {
            store.summary_max_tokens = max_tokens;
        }
        Ok(store)
    }

    /// Subscribe to `url`. An existing feed with the same URL (ignoring
    /// case) is returned as is; otherwise a new feed is stored and
    /// refreshed right away.
    pub async fn add_feed(&self, url: &str) -> Result<Feed> {
        let url = url.trim();
        if let Some(existing) = self.get_feed_from_url(url).await {
            debug!("Feed {} already subscribed as {}", url, existing.id);
            return Ok(existing);
        }

        let feed = Feed::new(url);
        self.feeds
            .write(&feed, FEEDS_PARTITION, Some(&feed.extra_fields()))
            .await?;
        self.feed_cache.insert(feed.clone()).await;
        info!("Added feed {} ({})", url, feed.id);

        self.refresh_feed(&feed.id).await?;
        Ok(self.get_feed(&feed.id).await.unwrap_or(feed))
    }

    pub async fn get_feed(&self, id: &str) -> Option<Feed> {
        if let Some(feed) = self.feed_cache.get(id).await {
            return Some(feed);
        }
        match self.feeds.get(id, FEEDS_PARTITION).await {
            Ok(Some(feed)) => {
                self.feed_cache.insert(feed.clone()).await;
                Some(feed)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to load feed {}: {}", id, e);
                None
            }
        }
    }

    pub async fn get_feed_from_url(&self, url: &str) -> Option<Feed> {
        if let Some(feed) = self.feed_cache.find_by_url(url).await {
            return Some(feed);
        }
        let filter = FieldFilter::text_eq("feedUrl", url.trim().to_lowercase()).to_string();
        match self.feeds.query(Some(&filter), Some(FEEDS_PARTITION), Some(1), 0).await {
            Ok(found) => {
                let feed = found.into_iter().next()?;
                self.feed_cache.insert(feed.clone()).await;
                Some(feed)
            }
            Err(e) => {
                warn!("Failed to look up feed by URL {}: {}", url, e);
                None
            }
        }
    }

    /// All feeds ordered by title, served from a snapshot that is reloaded
    /// from storage once it expires.
    pub async fn get_feeds(&self, top: Option<usize>, skip: usize) -> Vec<Feed> {
        if !self.feed_cache.is_fresh().await {
            match self.feeds.query(None, Some(FEEDS_PARTITION), None, 0).await {
                Ok(feeds) => {
                    debug!("Reloaded feed snapshot: {} feeds", feeds.len());
                    self.feed_cache.replace_all(feeds).await;
                }
                Err(e) => warn!("Failed to reload feeds, serving cached set: {}", e),
            }
        }
        paginate(self.feed_cache.all().await, top, skip)
    }

    /// Feeds whose title contains any whitespace-separated token of `text`.
    pub async fn query_feeds(&self, text: &str) -> Vec<Feed> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return Vec::new();
        }
        self.get_feeds(None, 0)
            .await
            .into_iter()
            .filter(|feed| tokens.iter().any(|token| feed.title.contains(token)))
            .collect()
    }

    pub async fn get_item(&self, feed_id: &str, item_id: &str) -> Result<FeedItem> {
        if let Some(item) = self.item_cache.find(feed_id, item_id).await {
            return Ok(item);
        }
        self.items
            .get(item_id, feed_id)
            .await?
            .ok_or_else(|| FeedscopeError::NotFound(format!("item {} of feed {}", item_id, feed_id)))
    }

    /// Items of one feed, newest first. `since` only narrows the result;
    /// the cache keeps everything.
    pub async fn get_items_from_feed(
        &self,
        feed_id: &str,
        top: Option<usize>,
        skip: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FeedItem>> {
        let feed = self
            .get_feed(feed_id)
            .await
            .ok_or_else(|| FeedscopeError::NotFound(format!("feed {}", feed_id)))?;
        self.warm_items(&feed).await?;

        let mut items = self.item_cache.items(feed_id).await;
        if let Some(since) = since {
            items.retain(|item| item.published_time >= since);
        }
        Ok(paginate(items, top, skip))
    }

    /// Items published in the last `recency_minutes` across all feeds.
    pub async fn get_recent_items(&self, recency_minutes: i64, top: Option<usize>, skip: usize) -> Vec<FeedItem> {
        // a window past chrono's range means no lower bound
        let since = ChronoDuration::try_minutes(recency_minutes)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut recent = Vec::new();
        for feed in self.get_feeds(None, 0).await {
            match self.get_items_from_feed(&feed.id, None, 0, Some(since)).await {
                Ok(items) => recent.extend(items),
                Err(e) => warn!("Skipping feed {} in recent items: {}", feed.id, e),
            }
        }
        sort_newest_first(&mut recent);
        paginate(recent, top, skip)
    }

    /// Items whose topics meet the topics derived from `text`, or whose
    /// title mentions one of them. `feed_filter` restricts the search to
    /// feeds matched by [`FeedStore::query_feeds`].
    pub async fn query_items(
        &self,
        text: &str,
        feed_filter: Option<&str>,
        top: Option<usize>,
        skip: usize,
    ) -> Vec<FeedItem> {
        let tokens: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
        let mut topics: HashSet<String> = match &self.llm {
            Some(llm) => match extract_topics(llm.as_ref(), text, self.summary_max_tokens).await {
                Ok(topics) => topics.into_iter().collect(),
                Err(e) => {
                    warn!("Topic extraction failed for '{}', using query words: {}", text, e);
                    HashSet::new()
                }
            },
            None => HashSet::new(),
        };
        topics.extend(tokens);
        if topics.is_empty() {
            return Vec::new();
        }

        let feeds = match feed_filter {
            Some(filter) => self.query_feeds(filter).await,
            None => self.get_feeds(None, 0).await,
        };

        let mut matched = Vec::new();
        for feed in feeds {
            if let Err(e) = self.warm_items(&feed).await {
                warn!("Skipping feed {} in item query: {}", feed.id, e);
                continue;
            }
            matched.extend(self.item_cache.items(&feed.id).await.into_iter().filter(|item| {
                let title = item.title.to_lowercase();
                item.topics.iter().any(|t| topics.contains(t))
                    || topics.iter().any(|t| title.contains(t.as_str()))
            }));
        }
        sort_newest_first(&mut matched);
        paginate(matched, top, skip)
    }

    /// Fetch and ingest one feed. Returns the newly stored items. A feed
    /// that cannot be fetched or parsed is flagged unreachable and yields no
    /// items instead of an error.
    pub async fn refresh_feed(&self, feed_id: &str) -> Result<Vec<FeedItem>> {
        let mut feed = self
            .get_feed(feed_id)
            .await
            .ok_or_else(|| FeedscopeError::NotFound(format!("feed {}", feed_id)))?;
        // Without the stored identities every parsed item would look new.
        self.warm_items(&feed).await?;

        let now = Utc::now();
        let parsed = match self.fetcher.fetch(&feed.feed_url).await {
            Ok(bytes) => parse_feed(&bytes, &feed.id, now),
            Err(e) => Err(e),
        };
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Refresh of {} failed: {}", feed.feed_url, e);
                self.mark_unreachable(feed).await;
                return Ok(Vec::new());
            }
        };

        let cutoff = now - self.retention;
        let mut known = self.item_cache.identity_keys(&feed.id).await;
        let mut fresh: Vec<FeedItem> = parsed
            .items
            .iter()
            .filter(|item| item.published_time >= cutoff)
            .filter(|item| known.insert(item.identity_key().to_string()))
            .cloned()
            .collect();
        let mut retries: Vec<FeedItem> = self
            .item_cache
            .items(&feed.id)
            .await
            .into_iter()
            .filter(|item| !item.is_summarized() && item.published_time >= cutoff)
            .collect();
        debug!(
            "Feed {}: {} parsed, {} new, {} awaiting summary",
            feed.feed_url,
            parsed.items.len(),
            fresh.len(),
            retries.len()
        );

        let summarized_retries = self.summarize(&feed.id, &mut fresh, &mut retries).await;

        let fresh_ids: HashSet<String> = fresh.iter().map(|item| item.id.clone()).collect();
        let mut to_store = fresh;
        to_store.extend(summarized_retries);
        let stored = self.store_items(&feed.id, to_store).await;
        let new_items: Vec<FeedItem> = stored
            .iter()
            .filter(|item| fresh_ids.contains(&item.id))
            .cloned()
            .collect();
        self.item_cache.merge(&feed.id, stored).await;

        self.apply_retention(&feed.id, cutoff).await;

        parsed.apply_to(&mut feed);
        feed.unreachable = false;
        feed.last_update_time = now;
        if let Err(e) = self
            .feeds
            .write(&feed, FEEDS_PARTITION, Some(&feed.extra_fields()))
            .await
        {
            error!("Failed to persist feed {}: {}", feed.id, e);
        }
        self.feed_cache.insert(feed.clone()).await;

        info!("Refreshed '{}': {} new items", feed.title, new_items.len());
        Ok(new_items)
    }

    /// Bring the feed's item cache up to date with storage when it is stale.
    /// A failed load leaves the cache stale so the next call tries again.
    async fn warm_items(&self, feed: &Feed) -> Result<()> {
        if !self
            .item_cache
            .is_stale(&feed.id, feed.latest_item_published_time)
            .await
        {
            return Ok(());
        }
        let filter = self
            .item_cache
            .head_time(&feed.id)
            .await
            .map(|head| FieldFilter::int("publishedTime", Comparison::Ge, head.timestamp_millis()).to_string());

        let items = self
            .items
            .query(filter.as_deref(), Some(&feed.id), None, 0)
            .await
            .map_err(|e| {
                warn!("Failed to load items of feed {}: {}", feed.id, e);
                e
            })?;
        self.item_cache.merge(&feed.id, items).await;
        Ok(())
    }

    /// Summarize new items and retry earlier failures, one call at a time.
    /// Returns the retried items that now carry a summary.
    async fn summarize(&self, feed_id: &str, fresh: &mut [FeedItem], retries: &mut Vec<FeedItem>) -> Vec<FeedItem> {
        let Some(llm) = &self.llm else {
            debug!("No LLM configured, storing items of {} unsummarized", feed_id);
            return Vec::new();
        };

        let mut vocabulary = self.item_cache.vocabulary(feed_id).await;
        for item in fresh.iter_mut().chain(retries.iter_mut()) {
            match summarize_item(llm.as_ref(), item, &vocabulary, self.summary_max_tokens).await {
                Ok(summary) => {
                    for topic in &summary.topics {
                        if !vocabulary.contains(topic) {
                            vocabulary.push(topic.clone());
                        }
                    }
                    item.summary = Some(summary.summary);
                    item.topics = summary.topics;
                }
                Err(e) => warn!("Summarization of '{}' failed, will retry: {}", item.title, e),
            }
        }

        retries.drain(..).filter(FeedItem::is_summarized).collect()
    }

    /// Persist `items` and return those actually written. A batch rejected
    /// for size falls back to one write per item.
    async fn store_items(&self, feed_id: &str, items: Vec<FeedItem>) -> Vec<FeedItem> {
        if items.is_empty() {
            return items;
        }
        match self
            .items
            .write_batch(&items, feed_id, Some(FeedItem::extra_fields))
            .await
        {
            Ok(()) => items,
            Err(FeedscopeError::StorageCapacity { key, .. }) => {
                warn!("Item {} too large for a batch, writing items of {} one by one", key, feed_id);
                let mut written = Vec::with_capacity(items.len());
                for item in items {
                    match self.items.write(&item, feed_id, Some(&item.extra_fields())).await {
                        Ok(()) => written.push(item),
                        Err(e) => error!("Dropping item '{}': {}", item.title, e),
                    }
                }
                written
            }
            Err(e) => {
                error!("Failed to store {} items of {}: {}", items.len(), feed_id, e);
                Vec::new()
            }
        }
    }

    /// Delete the feed's items published before `cutoff`, cached or not.
    async fn apply_retention(&self, feed_id: &str, cutoff: DateTime<Utc>) {
        let mut expired: Vec<String> = self
            .item_cache
            .remove_older_than(feed_id, cutoff)
            .await
            .into_iter()
            .map(|item| item.id)
            .collect();

        let filter = FieldFilter::int("publishedTime", Comparison::Lt, cutoff.timestamp_millis()).to_string();
        match self.items.query(Some(&filter), Some(feed_id), None, 0).await {
            Ok(stored) => {
                for item in stored {
                    if !expired.contains(&item.id) {
                        expired.push(item.id);
                    }
                }
            }
            Err(e) => warn!("Failed to query expired items of {}: {}", feed_id, e),
        }

        if expired.is_empty() {
            return;
        }
        match self.items.delete_batch(&expired, feed_id).await {
            Ok(()) => info!("Deleted {} expired items of {}", expired.len(), feed_id),
            Err(e) => warn!("Failed to delete expired items of {}: {}", feed_id, e),
        }
    }

    async fn mark_unreachable(&self, mut feed: Feed) {
        feed.unreachable = true;
        if let Err(e) = self
            .feeds
            .write(&feed, FEEDS_PARTITION, Some(&feed.extra_fields()))
            .await
        {
            warn!("Failed to flag feed {} unreachable: {}", feed.id, e);
        }
        self.feed_cache.insert(feed).await;
    }
}
