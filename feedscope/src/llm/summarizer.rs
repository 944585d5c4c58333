// Summarizer module
use serde_json::Value;
use tracing::{debug, info};

use super::{ChatMessage, LlmProvider, LlmRequest};
use crate::error::{FeedscopeError, Result};
use crate::model::FeedItem;

/// Longest item text sent to the model, in characters.
const MAX_INPUT_CHARS: usize = 12_000;
/// Most vocabulary entries offered for reuse in one prompt.
const MAX_VOCABULARY: usize = 200;

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize news articles and podcast episodes. \
Reply with a single JSON object and nothing else: \
{\"summary\": \"two or three sentences\", \"topics\": [\"short lowercase topic\", ...]}. \
Use between one and five topics. Keep the language of the original text.";

const TOPICS_SYSTEM_PROMPT: &str = "You extract search topics from a user query. \
Reply with a single JSON object and nothing else: {\"topics\": [\"short lowercase topic\", ...]}.";

#[derive(Debug, Clone, PartialEq)]
pub struct ItemSummary {
    pub summary: String,
    pub topics: Vec<String>,
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// The conversation ends with an assistant turn holding `{` so the model
/// continues a JSON object.
fn primed_request(system: &str, user: String, max_tokens: usize) -> LlmRequest {
    LlmRequest {
        messages: vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
            ChatMessage::assistant("{"),
        ],
        max_tokens: Some(max_tokens),
        temperature: Some(0.2),
        timeout_seconds: None,
    }
}

/// Parse a completion that may or may not repeat the priming brace.
fn completion_object(content: &str) -> Result<serde_json::Map<String, Value>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(FeedscopeError::LlmResponse("empty completion".to_string()));
    }
    let text = if trimmed.starts_with('{') || trimmed.starts_with("```") {
        trimmed.to_string()
    } else {
        format!("{{{}", trimmed)
    };

    let json = super::extract_json_from_text(&text)
        .ok_or_else(|| FeedscopeError::LlmResponse(format!("no JSON object in completion: {}", trimmed)))?;
    match serde_json::from_str::<Value>(&json) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(FeedscopeError::LlmResponse("completion is not a JSON object".to_string())),
        Err(e) => Err(FeedscopeError::LlmResponse(format!("invalid JSON in completion: {}", e))),
    }
}

/// Lowercased, trimmed, de-duplicated string entries of a `topics` array.
fn normalize_topics(value: &Value) -> Option<Vec<String>> {
    let mut topics: Vec<String> = Vec::new();
    for topic in value.as_array()? {
        let Some(topic) = topic.as_str() else {
            continue;
        };
        let topic = topic.trim().to_lowercase();
        if !topic.is_empty() && !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    Some(topics)
}

/// Validate a summarization completion: `summary` must be a non-empty
/// string and `topics` an array.
pub fn parse_summary_response(content: &str) -> Result<ItemSummary> {
    let object = completion_object(content)?;

    let summary = object
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FeedscopeError::LlmResponse("missing or empty summary".to_string()))?;
    let topics = object
        .get("topics")
        .and_then(normalize_topics)
        .ok_or_else(|| FeedscopeError::LlmResponse("topics is not an array".to_string()))?;

    Ok(ItemSummary {
        summary: summary.to_string(),
        topics,
    })
}

/// Summarize one item, nudging the model towards topics already used by
/// the feed.
pub async fn summarize_item<P: LlmProvider + ?Sized>(
    provider: &P,
    item: &FeedItem,
    vocabulary: &[String],
    max_tokens: usize,
) -> Result<ItemSummary> {
    let body = if item.content.trim().is_empty() {
        &item.description
    } else {
        &item.content
    };

    let mut prompt = format!(
        "Title: {}\n\n{}",
        item.title,
        truncate_chars(body, MAX_INPUT_CHARS)
    );
    if !vocabulary.is_empty() {
        let known: Vec<&str> = vocabulary
            .iter()
            .take(MAX_VOCABULARY)
            .map(String::as_str)
            .collect();
        prompt.push_str(&format!(
            "\n\nTopics already in use (reuse them when they fit): {}",
            known.join(", ")
        ));
    }

    let response = provider
        .generate(primed_request(SUMMARY_SYSTEM_PROMPT, prompt, max_tokens))
        .await
        .map_err(|e| FeedscopeError::LlmResponse(format!("{:#}", e)))?;

    let summary = parse_summary_response(&response.content)?;
    info!(
        "Summarized '{}': {} topics, {} tokens",
        item.title,
        summary.topics.len(),
        response.usage.total_tokens
    );
    Ok(summary)
}

/// Topics for a free-text query.
pub async fn extract_topics<P: LlmProvider + ?Sized>(
    provider: &P,
    text: &str,
    max_tokens: usize,
) -> Result<Vec<String>> {
    let response = provider
        .generate(primed_request(TOPICS_SYSTEM_PROMPT, text.to_string(), max_tokens))
        .await
        .map_err(|e| FeedscopeError::LlmResponse(format!("{:#}", e)))?;

    let object = completion_object(&response.content)?;
    let topics = object
        .get("topics")
        .and_then(normalize_topics)
        .ok_or_else(|| FeedscopeError::LlmResponse("topics is not an array".to_string()))?;
    debug!("Query '{}' maps to topics {:?}", text, topics);
    Ok(topics)
}
