use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{ExtraFields, ExtraValue, StoredEntity};

/// Partition shared by every feed record.
pub const FEEDS_PARTITION: &str = "feeds";

/// A subscribed RSS/Atom source with aggregated metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub id: String,
    pub title: String,
    pub subtitle: String,
    pub description: String,
    pub feed_url: String,
    pub language: Option<String>,
    pub link: Option<String>,
    pub image_url: Option<String>,
    pub author: Option<String>,
    pub copyright: Option<String>,
    pub generator: Option<String>,
    #[serde(default)]
    pub explicit: bool,
    #[serde(default)]
    pub unreachable: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub latest_item_published_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub first_item_published_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update_time: DateTime<Utc>,
}

impl Feed {
    /// New feed with a fresh id, empty metadata and zero timestamps.
    pub fn new(feed_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            subtitle: String::new(),
            description: String::new(),
            feed_url: feed_url.into(),
            language: None,
            link: None,
            image_url: None,
            author: None,
            copyright: None,
            generator: None,
            explicit: false,
            unreachable: false,
            categories: Vec::new(),
            latest_item_published_time: DateTime::<Utc>::UNIX_EPOCH,
            first_item_published_time: DateTime::<Utc>::UNIX_EPOCH,
            last_update_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn matches_url(&self, url: &str) -> bool {
        self.feed_url.eq_ignore_ascii_case(url.trim())
    }

    pub fn extra_fields(&self) -> ExtraFields {
        vec![
            ("feedUrl".to_string(), ExtraValue::Text(self.feed_url.to_lowercase())),
            (
                "lastUpdateTime".to_string(),
                ExtraValue::Int(self.last_update_time.timestamp_millis()),
            ),
        ]
    }
}

impl StoredEntity for Feed {
    fn row_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    Post,
    Podcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemGuid {
    pub guid: String,
    pub is_link: bool,
}

/// Outbound link found in an item's Markdown content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefLink {
    pub url: String,
    pub title: String,
}

/// One entry (article or episode) belonging to a Feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub feed_id: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: String,
    pub author: Option<String>,
    /// Markdown
    pub content: String,
    pub image_url: Option<String>,
    pub link: String,
    pub guid: Option<ItemGuid>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub enclosure_url: Option<String>,
    /// Seconds
    pub duration: Option<u64>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    #[serde(default)]
    pub explicit: bool,
    pub summary: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub ref_links: Vec<RefLink>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub published_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update_time: DateTime<Utc>,
}

impl FeedItem {
    /// Dedup key: the guid when present, else the link.
    pub fn identity_key(&self) -> &str {
        match &self.guid {
            Some(guid) => &guid.guid,
            None => &self.link,
        }
    }

    pub fn is_summarized(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    pub fn extra_fields(&self) -> ExtraFields {
        vec![
            (
                "publishedTime".to_string(),
                ExtraValue::Int(self.published_time.timestamp_millis()),
            ),
            ("identity".to_string(), ExtraValue::Text(self.identity_key().to_string())),
        ]
    }
}

impl StoredEntity for FeedItem {
    fn row_key(&self) -> String {
        self.id.clone()
    }
}

/// Sort newest first.
pub fn sort_newest_first(items: &mut [FeedItem]) {
    items.sort_by(|a, b| b.published_time.cmp(&a.published_time));
}

/// `skip`/`top` pagination over an owned list.
pub fn paginate<T>(items: Vec<T>, top: Option<usize>, skip: usize) -> Vec<T> {
    let iter = items.into_iter().skip(skip);
    match top {
        Some(top) => iter.take(top).collect(),
        None => iter.collect(),
    }
}
