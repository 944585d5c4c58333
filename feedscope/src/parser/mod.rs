//! RSS 2.0, RSS 1.0 (RDF) and Atom normalization into [`Feed`] metadata and
//! [`FeedItem`]s.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FeedscopeError, Result};
use crate::model::{Feed, FeedItem, ItemGuid, ItemType};

pub mod markdown;
pub mod xml;

use markdown::{extract_ref_links, html_to_markdown};
use xml::{Namespaces, Ns, XmlElement};

pub const UNTITLED_FEED: &str = "Untitled Feed";

/// Channel metadata and extracted items of one fetched document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    pub title: String,
    pub subtitle: String,
    pub description: String,
    pub language: Option<String>,
    pub link: Option<String>,
    pub image_url: Option<String>,
    pub author: Option<String>,
    pub copyright: Option<String>,
    pub generator: Option<String>,
    pub explicit: bool,
    pub categories: Vec<String>,
    pub items: Vec<FeedItem>,
}

impl ParsedFeed {
    /// Copy channel metadata onto `feed`. Item time bounds are only touched
    /// when at least one item was extracted.
    pub fn apply_to(&self, feed: &mut Feed) {
        feed.title = self.title.clone();
        feed.subtitle = self.subtitle.clone();
        feed.description = self.description.clone();
        feed.language = self.language.clone();
        feed.link = self.link.clone();
        feed.image_url = self.image_url.clone();
        feed.author = self.author.clone();
        feed.copyright = self.copyright.clone();
        feed.generator = self.generator.clone();
        feed.explicit = self.explicit;
        feed.categories = self.categories.clone();

        if let Some((first, latest)) = self.published_bounds() {
            feed.first_item_published_time = first;
            feed.latest_item_published_time = latest;
        }
    }

    /// Oldest and newest item publish times.
    pub fn published_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.items.iter().map(|i| i.published_time).min()?;
        let latest = self.items.iter().map(|i| i.published_time).max()?;
        Some((first, latest))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Rss,
    Rdf,
    Atom,
}

/// Field lookup over one document: namespaced variants are tried before the
/// bare tag.
struct Fields {
    ns: Namespaces,
    dialect: Dialect,
}

type Candidate<'a> = (Option<Ns>, &'a str);

impl Fields {
    fn name(&self, candidate: Candidate<'_>) -> String {
        match candidate {
            (Some(ns), local) => self.ns.qualify(ns, local),
            (None, local) => local.to_string(),
        }
    }

    fn element<'e>(&self, el: &'e XmlElement, candidates: &[Candidate<'_>]) -> Option<&'e XmlElement> {
        candidates.iter().find_map(|c| {
            let name = self.name(*c);
            el.children.iter().find(|child| child.name == name)
        })
    }

    fn elements<'e>(&self, el: &'e XmlElement, candidate: Candidate<'_>) -> Vec<&'e XmlElement> {
        let name = self.name(candidate);
        el.children.iter().filter(|c| c.name == name).collect()
    }

    fn text(&self, el: &XmlElement, candidates: &[Candidate<'_>]) -> Option<String> {
        candidates.iter().find_map(|c| {
            let name = self.name(*c);
            el.children
                .iter()
                .filter(|child| child.name == name)
                .find_map(|child| child.text_trimmed().map(str::to_string))
        })
    }

    fn attr(&self, el: &XmlElement, candidates: &[Candidate<'_>], attr: &str) -> Option<String> {
        candidates.iter().find_map(|c| {
            let name = self.name(*c);
            el.children
                .iter()
                .filter(|child| child.name == name)
                .find_map(|child| non_empty(child.attr(attr)))
        })
    }

    /// Atom `link@href`, then bare `link@href`, then `link` text. Links whose
    /// rel is not `alternate` are skipped.
    fn link(&self, el: &XmlElement) -> Option<String> {
        let mut candidates = vec![self.elements(el, (Some(Ns::Atom), "link"))];
        if self.ns.qualify(Ns::Atom, "link") != "link" {
            candidates.push(self.elements(el, (None, "link")));
        }

        for links in &candidates {
            let href = links
                .iter()
                .filter(|l| l.attr("rel").map_or(true, |rel| rel == "alternate"))
                .find_map(|l| non_empty(l.attr("href")));
            if href.is_some() {
                return href;
            }
        }
        candidates
            .iter()
            .flatten()
            .filter(|l| l.attr("href").is_none())
            .find_map(|l| l.text_trimmed().map(str::to_string))
    }

    fn atom_link_with_rel(&self, el: &XmlElement, rel: &str) -> Option<String> {
        let mut links = self.elements(el, (Some(Ns::Atom), "link"));
        if self.ns.qualify(Ns::Atom, "link") != "link" {
            links.extend(self.elements(el, (None, "link")));
        }
        links
            .into_iter()
            .filter(|l| l.attr("rel") == Some(rel))
            .find_map(|l| non_empty(l.attr("href")))
    }

    fn author(&self, el: &XmlElement) -> Option<String> {
        self.text(el, &[(Some(Ns::Itunes), "author"), (Some(Ns::Media), "credit")])
            .or_else(|| self.text(el, &[(Some(Ns::DublinCore), "creator")]))
            .or_else(|| self.text(el, &[(None, "managingEditor")]))
            .or_else(|| {
                self.element(el, &[(Some(Ns::Atom), "author"), (None, "author")])
                    .and_then(|author| {
                        self.text(author, &[(Some(Ns::Atom), "name"), (None, "name")])
                            .or_else(|| author.text_trimmed().map(str::to_string))
                    })
            })
    }

    fn categories(&self, el: &XmlElement) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |value: Option<&str>| {
            if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
                if seen.insert(value.to_lowercase()) {
                    out.push(value.to_string());
                }
            }
        };

        for category in self.elements(el, (None, "category")) {
            push(category.text_trimmed().or(category.attr("term")));
        }
        if self.ns.qualify(Ns::Atom, "category") != "category" {
            for category in self.elements(el, (Some(Ns::Atom), "category")) {
                push(category.attr("term"));
            }
        }
        for category in self.elements(el, (Some(Ns::Itunes), "category")) {
            push(category.attr("text"));
            for sub in self.elements(category, (Some(Ns::Itunes), "category")) {
                push(sub.attr("text"));
            }
        }
        for subject in self.elements(el, (Some(Ns::DublinCore), "subject")) {
            push(subject.text_trimmed());
        }
        out
    }

    fn explicit(&self, el: &XmlElement) -> bool {
        self.text(el, &[(Some(Ns::Itunes), "explicit"), (Some(Ns::Podcast), "explicit")])
            .is_some_and(|v| matches!(v.to_lowercase().as_str(), "yes" | "true" | "explicit"))
    }

    /// Text of an HTML-bearing element; inline XHTML is serialized back.
    fn html(&self, el: &XmlElement, candidates: &[Candidate<'_>]) -> Option<String> {
        candidates.iter().find_map(|c| {
            let name = self.name(*c);
            el.children
                .iter()
                .filter(|child| child.name == name)
                .find_map(|child| {
                    if child.attr("type") == Some("xhtml") && !child.children.is_empty() {
                        Some(child.inner_xml())
                    } else {
                        child.text_trimmed().map(str::to_string)
                    }
                })
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Parse `H:MM:SS`, `MM:SS` or plain seconds into seconds.
pub fn parse_duration(value: &str) -> Option<u64> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut seconds = 0u64;
    for (index, part) in parts.iter().enumerate() {
        let part = part.trim();
        let n = if index == parts.len() - 1 {
            // fractional seconds are truncated
            part.parse::<f64>().ok().filter(|n| n.is_finite() && *n >= 0.0)? as u64
        } else {
            part.parse::<u64>().ok()?
        };
        seconds = seconds.checked_mul(60)?.checked_add(n)?;
    }
    Some(seconds)
}

/// RFC 2822 first, then RFC 3339.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a feed document. Items are assigned to `feed_id`; missing or
/// unparseable publish dates fall back to `fetched_at`.
pub fn parse_feed(bytes: &[u8], feed_id: &str, fetched_at: DateTime<Utc>) -> Result<ParsedFeed> {
    let root = xml::parse_document(bytes)?;

    let (dialect, channel) = match root.local_name() {
        "rss" => {
            let channel = root
                .children
                .iter()
                .find(|c| c.local_name() == "channel")
                .ok_or_else(|| FeedscopeError::Format("rss document has no channel".to_string()))?;
            (Dialect::Rss, channel)
        }
        "RDF" => {
            let channel = root
                .children
                .iter()
                .find(|c| c.local_name() == "channel")
                .ok_or_else(|| FeedscopeError::Format("RDF document has no channel".to_string()))?;
            (Dialect::Rdf, channel)
        }
        "feed" => (Dialect::Atom, &root),
        other => {
            return Err(FeedscopeError::Format(format!(
                "unrecognized root element <{}>",
                other
            )))
        }
    };

    let fields = Fields {
        ns: Namespaces::resolve(&[&root, channel]),
        dialect,
    };

    let item_elements: Vec<&XmlElement> = match dialect {
        Dialect::Rss => channel.children.iter().filter(|c| c.local_name() == "item").collect(),
        Dialect::Rdf => root.children.iter().filter(|c| c.local_name() == "item").collect(),
        Dialect::Atom => fields.elements(channel, (Some(Ns::Atom), "entry")),
    };

    let total = item_elements.len();
    let items: Vec<FeedItem> = item_elements
        .into_iter()
        .filter_map(|el| parse_item(&fields, el, feed_id, fetched_at))
        .collect();
    debug!("Extracted {} of {} items", items.len(), total);

    Ok(ParsedFeed {
        title: fields
            .text(channel, &[(Some(Ns::Atom), "title"), (None, "title")])
            .unwrap_or_else(|| UNTITLED_FEED.to_string()),
        subtitle: fields
            .text(channel, &[(Some(Ns::Itunes), "subtitle"), (Some(Ns::Atom), "subtitle"), (None, "subtitle")])
            .unwrap_or_default(),
        description: fields
            .text(
                channel,
                &[(None, "description"), (Some(Ns::Itunes), "summary"), (Some(Ns::Atom), "subtitle")],
            )
            .map(|d| html_to_markdown(&d))
            .unwrap_or_default(),
        language: fields
            .text(channel, &[(None, "language"), (Some(Ns::DublinCore), "language")])
            .or_else(|| non_empty(root.attr("xml:lang")))
            .or_else(|| non_empty(channel.attr("xml:lang"))),
        link: fields.link(channel),
        image_url: channel_image(&fields, channel),
        author: fields.author(channel),
        copyright: fields.text(
            channel,
            &[(None, "copyright"), (Some(Ns::Atom), "rights"), (None, "rights"), (Some(Ns::DublinCore), "rights")],
        ),
        generator: fields.text(channel, &[(None, "generator"), (Some(Ns::Atom), "generator")]),
        explicit: fields.explicit(channel),
        categories: fields.categories(channel),
        items,
    })
}

fn channel_image(fields: &Fields, channel: &XmlElement) -> Option<String> {
    fields
        .element(channel, &[(None, "image")])
        .and_then(|image| {
            fields
                .text(image, &[(None, "url")])
                .or_else(|| non_empty(image.attr("href")))
                .or_else(|| non_empty(image.attr("rdf:resource")))
        })
        .or_else(|| fields.attr(channel, &[(Some(Ns::Itunes), "image")], "href"))
        .or_else(|| {
            fields.text(
                channel,
                &[(Some(Ns::Atom), "logo"), (None, "logo"), (Some(Ns::Atom), "icon"), (None, "icon")],
            )
        })
}

fn item_guid(fields: &Fields, el: &XmlElement) -> Option<ItemGuid> {
    if let Some(guid) = fields.element(el, &[(None, "guid")]) {
        if let Some(value) = guid.text_trimmed() {
            return Some(ItemGuid {
                guid: value.to_string(),
                is_link: !guid
                    .attr("isPermaLink")
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("false")),
            });
        }
    }

    let id = fields.text(el, &[(Some(Ns::Atom), "id"), (None, "id")])?;
    let is_link = id.starts_with("http://") || id.starts_with("https://");
    Some(ItemGuid { guid: id, is_link })
}

fn item_image(fields: &Fields, el: &XmlElement) -> Option<String> {
    fields
        .attr(el, &[(Some(Ns::Itunes), "image")], "href")
        .or_else(|| fields.attr(el, &[(Some(Ns::Media), "thumbnail")], "url"))
        .or_else(|| {
            let group = fields.element(el, &[(Some(Ns::Media), "group")]);
            [Some(el), group]
                .into_iter()
                .flatten()
                .flat_map(|scope| fields.elements(scope, (Some(Ns::Media), "content")))
                .filter(|c| {
                    c.attr("medium") == Some("image")
                        || c.attr("type").is_some_and(|t| t.starts_with("image/"))
                })
                .find_map(|c| non_empty(c.attr("url")))
        })
        .or_else(|| {
            fields
                .element(el, &[(None, "image")])
                .and_then(|image| {
                    fields
                        .text(image, &[(None, "url")])
                        .or_else(|| non_empty(image.attr("href")))
                        .or_else(|| image.text_trimmed().map(str::to_string))
                })
        })
}

fn parse_item(
    fields: &Fields,
    el: &XmlElement,
    feed_id: &str,
    fetched_at: DateTime<Utc>,
) -> Option<FeedItem> {
    let guid = item_guid(fields, el);

    let link = fields
        .link(el)
        .or_else(|| guid.as_ref().filter(|g| g.is_link).map(|g| g.guid.clone()));
    let Some(link) = link else {
        debug!("Dropping item without a link");
        return None;
    };

    let enclosure_url = fields
        .attr(el, &[(None, "enclosure")], "url")
        .or_else(|| fields.atom_link_with_rel(el, "enclosure"));

    let description = fields
        .html(el, &[(None, "description"), (Some(Ns::Atom), "summary"), (None, "summary"), (Some(Ns::Itunes), "summary")])
        .map(|html| html_to_markdown(&html))
        .unwrap_or_default();
    let content = fields
        .html(el, &[(Some(Ns::Content), "encoded"), (Some(Ns::Atom), "content"), (None, "content")])
        .map(|html| html_to_markdown(&html))
        .unwrap_or_default();

    if content.is_empty() && description.is_empty() {
        debug!("Dropping item {} without content or description", link);
        return None;
    }
    let content = if content.is_empty() {
        description.clone()
    } else {
        content
    };

    let date_candidates: &[Candidate<'_>] = match fields.dialect {
        Dialect::Atom => &[(Some(Ns::Atom), "published"), (None, "published"), (Some(Ns::Atom), "updated"), (None, "updated")],
        _ => &[(None, "pubDate"), (Some(Ns::DublinCore), "date"), (Some(Ns::Atom), "published"), (Some(Ns::Atom), "updated")],
    };
    let published_time = date_candidates
        .iter()
        .filter_map(|c| fields.text(el, &[*c]))
        .find_map(|value| parse_date(&value))
        .unwrap_or(fetched_at);
    let last_update_time = fields
        .text(el, &[(Some(Ns::Atom), "updated"), (None, "updated")])
        .and_then(|value| parse_date(&value))
        .unwrap_or(published_time);

    let ref_links = extract_ref_links(&content, &link);

    Some(FeedItem {
        id: Uuid::new_v4().to_string(),
        feed_id: feed_id.to_string(),
        item_type: if enclosure_url.is_some() {
            ItemType::Podcast
        } else {
            ItemType::Post
        },
        title: fields
            .text(el, &[(Some(Ns::Atom), "title"), (None, "title"), (Some(Ns::Itunes), "title")])
            .unwrap_or_default(),
        subtitle: fields.text(el, &[(Some(Ns::Itunes), "subtitle")]),
        description,
        author: fields.author(el),
        content,
        image_url: item_image(fields, el),
        link,
        guid,
        categories: fields.categories(el),
        enclosure_url,
        duration: fields
            .text(el, &[(Some(Ns::Itunes), "duration")])
            .and_then(|d| parse_duration(&d)),
        season: fields
            .text(el, &[(Some(Ns::Itunes), "season"), (Some(Ns::Podcast), "season")])
            .and_then(|s| s.parse().ok()),
        episode: fields
            .text(el, &[(Some(Ns::Itunes), "episode"), (Some(Ns::Podcast), "episode")])
            .and_then(|e| e.parse().ok()),
        explicit: fields.explicit(el),
        summary: None,
        topics: Vec::new(),
        ref_links,
        published_time,
        last_update_time,
    })
}
