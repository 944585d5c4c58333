//! HTML to Markdown conversion and outbound link extraction.

use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::model::RefLink;

/// Wide enough that html2text never wraps a URL.
const RENDER_WIDTH: usize = 10_000;

/// Convert an HTML fragment to Markdown-flavoured text. Plain text passes
/// through unchanged apart from entity decoding.
pub fn html_to_markdown(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    match html2text::from_read(html.as_bytes(), RENDER_WIDTH) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!("Failed to convert HTML to Markdown: {}", e);
            html.trim().to_string()
        }
    }
}

/// Links in `markdown`, inline `[text](url "title")` and reference style
/// `[text][n]` with `[n]: url`. Links equal to `own_link` are skipped and
/// results are unique by URL, in order of first appearance.
pub fn extract_ref_links(markdown: &str, own_link: &str) -> Vec<RefLink> {
    let definitions = reference_definitions(markdown);
    let mut found: Vec<RefLink> = Vec::new();
    let mut referenced: HashSet<String> = HashSet::new();

    let bytes = markdown.as_bytes();
    let mut pos = 0;
    while let Some(offset) = markdown[pos..].find('[') {
        let open = pos + offset;
        pos = open + 1;

        // images are not outbound links
        if open > 0 && bytes[open - 1] == b'!' {
            continue;
        }
        let Some(close) = markdown[open + 1..].find(']').map(|i| open + 1 + i) else {
            break;
        };
        let text = markdown[open + 1..close].trim();

        match bytes.get(close + 1) {
            Some(b'(') => {
                let Some(end) = markdown[close + 2..].find(')').map(|i| close + 2 + i) else {
                    continue;
                };
                let (url, title) = split_destination(&markdown[close + 2..end]);
                found.push(link(url, title.unwrap_or(text)));
                pos = end + 1;
            }
            Some(b'[') => {
                let Some(end) = markdown[close + 2..].find(']').map(|i| close + 2 + i) else {
                    continue;
                };
                let label = markdown[close + 2..end].trim();
                let label = if label.is_empty() { text } else { label };
                if let Some((url, title, _)) = definitions.get(&label.to_lowercase()) {
                    referenced.insert(label.to_lowercase());
                    found.push(link(url, title.as_deref().unwrap_or(text)));
                }
                pos = end + 1;
            }
            // a definition line itself, or plain brackets
            _ => pos = close + 1,
        }
    }

    // definitions nobody referenced still point somewhere
    let mut leftovers: Vec<_> = definitions
        .iter()
        .filter(|(label, _)| !referenced.contains(*label))
        .collect();
    leftovers.sort_by_key(|(_, (_, _, order))| *order);
    for (label, (url, title, _)) in leftovers {
        found.push(link(url, title.as_deref().unwrap_or(label)));
    }

    let own = normalize(own_link);
    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|l| l.url.starts_with("http://") || l.url.starts_with("https://"))
        .filter(|l| normalize(&l.url) != own)
        .filter(|l| seen.insert(l.url.clone()))
        .collect()
}

type Definitions = HashMap<String, (String, Option<String>, usize)>;

fn reference_definitions(markdown: &str) -> Definitions {
    let mut definitions = HashMap::new();
    for (order, line) in markdown.lines().enumerate() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('[') else {
            continue;
        };
        let Some((label, destination)) = rest.split_once("]:") else {
            continue;
        };
        let (url, title) = split_destination(destination);
        if url.is_empty() {
            continue;
        }
        definitions
            .entry(label.trim().to_lowercase())
            .or_insert((url.to_string(), title.map(str::to_string), order));
    }
    definitions
}

/// `url "optional title"` as found inside parentheses or after `]:`.
fn split_destination(destination: &str) -> (&str, Option<&str>) {
    let destination = destination.trim();
    let (url, rest) = match destination.split_once(char::is_whitespace) {
        Some((url, rest)) => (url, rest.trim()),
        None => (destination, ""),
    };
    let url = url.trim_start_matches('<').trim_end_matches('>');
    let title = rest
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    (url, title)
}

fn link(url: &str, title: &str) -> RefLink {
    let title = if title.is_empty() { url } else { title };
    RefLink {
        url: url.to_string(),
        title: title.to_string(),
    }
}

fn normalize(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_links_with_and_without_title() {
        let md = r#"See [the docs](https://docs.rs "Docs home") and [crates](https://crates.io)."#;
        let links = extract_ref_links(md, "https://example.com/post");
        assert_eq!(
            links,
            vec![
                RefLink {
                    url: "https://docs.rs".to_string(),
                    title: "Docs home".to_string()
                },
                RefLink {
                    url: "https://crates.io".to_string(),
                    title: "crates".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_reference_links() {
        let md = "Read [part one][1] then [part two][2].\n\n[1]: https://a.example/1\n[2]: https://a.example/2 \"Second\"\n";
        let links = extract_ref_links(md, "");
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].title, "part one");
        assert_eq!(links[1].url, "https://a.example/2");
        assert_eq!(links[1].title, "Second");
    }

    #[test]
    fn test_own_link_duplicates_and_images_skipped() {
        let md = "[self](https://example.com/post/) [a](https://a.example) [again](https://a.example) ![img](https://img.example/x.png) [rel](/relative)";
        let links = extract_ref_links(md, "https://example.com/post");
        let urls: Vec<_> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example"]);
    }

    #[test]
    fn test_html_conversion_keeps_link_targets() {
        let md = html_to_markdown(r#"<p>Hello <a href="https://rust-lang.org">Rust</a></p>"#);
        assert!(md.contains("Hello"));
        let links = extract_ref_links(&md, "");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://rust-lang.org");
    }

    #[test]
    fn test_blank_html_is_empty() {
        assert_eq!(html_to_markdown("  \n "), "");
        assert_eq!(html_to_markdown("plain words"), "plain words");
    }
}
