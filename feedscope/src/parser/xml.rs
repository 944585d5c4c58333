//! Minimal attributed element tree over quick-xml events, plus namespace
//! prefix resolution for the feed vocabularies we read.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

use crate::error::{FeedscopeError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    /// Qualified name as written, e.g. `itunes:author`.
    pub name: String,
    pub attrs: Vec<(String, String)>,
    /// Direct text and CDATA content, concatenated, whitespace kept.
    pub text: String,
    /// Text between this element's end tag and the next sibling.
    pub tail: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn text_trimmed(&self) -> Option<&str> {
        let text = self.text.trim();
        (!text.is_empty()).then_some(text)
    }

    /// Serialized child markup, for inline XHTML content.
    pub fn inner_xml(&self) -> String {
        // `text` is the leading text followed by every child's tail
        let tails: usize = self.children.iter().map(|c| c.tail.len()).sum();
        let lead = &self.text[..self.text.len() - tails];
        let mut out = quick_xml::escape::escape(lead).into_owned();
        for child in &self.children {
            child.write_xml(&mut out);
            out.push_str(&quick_xml::escape::escape(child.tail.as_str()));
        }
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(self.local_name());
        for (k, v) in &self.attrs {
            if k == "xmlns" || k.starts_with("xmlns:") {
                continue;
            }
            out.push_str(&format!(" {}=\"{}\"", k, quick_xml::escape::escape(v.as_str())));
        }
        out.push('>');
        out.push_str(&self.inner_xml());
        out.push_str("</");
        out.push_str(self.local_name());
        out.push('>');
    }
}

fn push_text(stack: &mut [XmlElement], text: &str) {
    if let Some(current) = stack.last_mut() {
        current.text.push_str(text);
        if let Some(last) = current.children.last_mut() {
            last.tail.push_str(text);
        }
    }
}

fn element_from(start: &BytesStart<'_>) -> XmlElement {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let attrs = start
        .attributes()
        .with_checks(false)
        .filter_map(|a| a.ok())
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
            let value = match a.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
            };
            (key, value)
        })
        .collect();
    XmlElement {
        name,
        attrs,
        ..Default::default()
    }
}

/// Parse a whole document into its root element.
pub fn parse_document(bytes: &[u8]) -> Result<XmlElement> {
    // untrimmed, so inline markup keeps the spaces around it
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(false);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            FeedscopeError::Format(format!(
                "malformed XML at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(start) => stack.push(element_from(&start)),
            Event::Empty(start) => {
                let element = element_from(&start);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = root.or(Some(element)),
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| FeedscopeError::Format("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = root.or(Some(element)),
                }
            }
            Event::Text(text) => match text.unescape() {
                Ok(t) => push_text(&mut stack, &t),
                // HTML entities such as &nbsp; are left for the Markdown step
                Err(_) => push_text(&mut stack, &String::from_utf8_lossy(&text)),
            },
            Event::CData(data) => push_text(&mut stack, &String::from_utf8_lossy(&data.into_inner())),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(FeedscopeError::Format(format!(
            "unexpected end of document inside <{}>",
            stack.last().map(|e| e.name.as_str()).unwrap_or_default()
        )));
    }
    root.ok_or_else(|| FeedscopeError::Format("document has no root element".to_string()))
}

/// Namespaces read from feeds, with their conventional prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ns {
    Itunes,
    Podcast,
    Atom,
    Media,
    DublinCore,
    Content,
}

impl Ns {
    const ALL: [Ns; 6] = [
        Ns::Itunes,
        Ns::Podcast,
        Ns::Atom,
        Ns::Media,
        Ns::DublinCore,
        Ns::Content,
    ];

    fn uri(self) -> &'static str {
        match self {
            Ns::Itunes => "http://www.itunes.com/dtds/podcast-1.0.dtd",
            Ns::Podcast => "https://podcastindex.org/namespace/1.0",
            Ns::Atom => "http://www.w3.org/2005/Atom",
            Ns::Media => "http://search.yahoo.com/mrss/",
            Ns::DublinCore => "http://purl.org/dc/elements/1.1/",
            Ns::Content => "http://purl.org/rss/1.0/modules/content/",
        }
    }

    fn conventional_prefix(self) -> &'static str {
        match self {
            Ns::Itunes => "itunes",
            Ns::Podcast => "podcast",
            Ns::Atom => "atom",
            Ns::Media => "media",
            Ns::DublinCore => "dc",
            Ns::Content => "content",
        }
    }
}

/// Prefix in use for each known namespace in one document. An empty prefix
/// means the namespace is the default one.
#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    prefixes: HashMap<Ns, String>,
}

impl Namespaces {
    /// Declarations on the root, then on the channel element. Later scopes
    /// win on conflict.
    pub fn resolve(scopes: &[&XmlElement]) -> Self {
        let mut by_uri: HashMap<&str, String> = HashMap::new();
        for scope in scopes {
            for (key, value) in &scope.attrs {
                let prefix = if key == "xmlns" {
                    ""
                } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                    prefix
                } else {
                    continue;
                };
                by_uri.insert(value.trim().trim_end_matches('/'), prefix.to_string());
            }
        }

        let prefixes = Ns::ALL
            .iter()
            .map(|ns| {
                let prefix = by_uri
                    .get(ns.uri().trim_end_matches('/'))
                    .cloned()
                    .unwrap_or_else(|| ns.conventional_prefix().to_string());
                (*ns, prefix)
            })
            .collect();
        Self { prefixes }
    }

    pub fn qualify(&self, ns: Ns, local: &str) -> String {
        match self.prefixes.get(&ns).map(String::as_str) {
            Some("") => local.to_string(),
            Some(prefix) => format!("{}:{}", prefix, local),
            None => format!("{}:{}", ns.conventional_prefix(), local),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_with_cdata_and_entities() {
        let doc = br#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
              <title>A &amp; B</title>
              <description><![CDATA[<p>Hello</p>]]></description>
              <enclosure url="http://x/a.mp3" type="audio/mpeg"/>
            </channel></rss>"#;
        let root = parse_document(doc).unwrap();
        assert_eq!(root.name, "rss");
        let channel = &root.children[0];
        assert_eq!(channel.children_named("title").next().unwrap().text, "A & B");
        assert_eq!(channel.children_named("description").next().unwrap().text, "<p>Hello</p>");
        assert_eq!(
            channel.children_named("enclosure").next().unwrap().attr("url"),
            Some("http://x/a.mp3")
        );
    }

    #[test]
    fn test_unknown_entity_kept_raw() {
        let root = parse_document(b"<a>x&nbsp;y</a>").unwrap();
        assert_eq!(root.text, "x&nbsp;y");
    }

    #[test]
    fn test_malformed_documents_are_format_errors() {
        let docs: [&[u8]; 4] = [b"<rss><channel></rss>", b"<rss><channel>", b"", b"just text"];
        for doc in docs {
            let err = parse_document(doc).unwrap_err();
            assert!(matches!(err, FeedscopeError::Format(_)));
        }
    }

    #[test]
    fn test_namespace_resolution_prefers_channel_scope() {
        let root = parse_document(
            br#"<rss xmlns:it="http://www.itunes.com/dtds/podcast-1.0.dtd">
                 <channel xmlns:pod="http://www.itunes.com/dtds/podcast-1.0.dtd"/>
               </rss>"#,
        )
        .unwrap();
        let root_only = Namespaces::resolve(&[&root]);
        assert_eq!(root_only.qualify(Ns::Itunes, "author"), "it:author");

        let both = Namespaces::resolve(&[&root, &root.children[0]]);
        assert_eq!(both.qualify(Ns::Itunes, "author"), "pod:author");
        // undeclared falls back to the usual prefix
        assert_eq!(both.qualify(Ns::DublinCore, "creator"), "dc:creator");
    }

    #[test]
    fn test_default_namespace_has_no_prefix() {
        let root = parse_document(br#"<feed xmlns="http://www.w3.org/2005/Atom"/>"#).unwrap();
        let ns = Namespaces::resolve(&[&root]);
        assert_eq!(ns.qualify(Ns::Atom, "link"), "link");
    }

    #[test]
    fn test_inner_xml() {
        let root = parse_document(br#"<content type="xhtml"><div xmlns="http://www.w3.org/1999/xhtml"><p>Hi <a href="http://x">there</a></p></div></content>"#).unwrap();
        assert_eq!(
            root.inner_xml(),
            r#"<div><p>Hi <a href="http://x">there</a></p></div>"#
        );
    }

    #[test]
    fn test_mixed_content_keeps_text_order_and_spacing() {
        let root = parse_document(b"<p>Hi <b>you</b> over <br/>there</p>").unwrap();
        assert_eq!(root.inner_xml(), "Hi <b>you</b> over <br></br>there");
        assert_eq!(root.text, "Hi  over there");
        assert_eq!(root.children[0].tail, " over ");
    }
}
