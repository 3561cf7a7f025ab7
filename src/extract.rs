//! Tolerant extraction of structured payloads from LLM output.
//!
//! Models routinely wrap the JSON they were asked for in explanatory prose,
//! XML-ish tags, or fenced code blocks. Extraction tries, in order: the
//! innermost named tag block, then the innermost fenced code block, then the
//! raw text. The first candidate that deserialises wins; if none does, a
//! typed [`ExtractError`] is returned so the retry policy targets "did the
//! output parse", not just "did the call succeed".

use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// No candidate block deserialised into the expected shape. Carries the
    /// serde error of the last candidate tried.
    #[error("no parsable payload in model output: {detail}")]
    Unparsable { detail: String },
}

/// Innermost `<tag>...</tag>` block, if present.
///
/// The text between the last opening tag and the first closing tag is by
/// construction the innermost complete pair, however deep the nesting.
pub fn tagged_block(text: &str, tag: &str) -> Option<String> {
    let open = Regex::new(&format!(r"<{tag}(?:\s[^>]*)?>")).ok()?;
    let close = format!("</{tag}>");
    let end = text.find(&close)?;
    let before = &text[..end];
    let inner_start = open.find_iter(before).last()?.end();
    Some(before[inner_start..].trim().to_string())
}

/// First fenced code block (```json ... ``` or bare ```), if present.
pub fn fenced_block(text: &str) -> Option<String> {
    let re = Regex::new(r"(?s)```[a-zA-Z0-9_-]*\s*\n?(.*?)```").ok()?;
    Some(re.captures(text)?.get(1)?.as_str().trim().to_string())
}

/// Extract and deserialise a payload of type `T` from raw model output.
///
/// Candidate order: tagged block, fenced block, raw text. A fenced block
/// inside a tagged block is also tried, since models often stack both.
pub fn parse_payload<T: DeserializeOwned>(text: &str, tag: &str) -> Result<T, ExtractError> {
    let mut candidates: Vec<String> = Vec::new();
    if let Some(tagged) = tagged_block(text, tag) {
        if let Some(fenced_inside) = fenced_block(&tagged) {
            candidates.push(fenced_inside);
        }
        candidates.push(tagged);
    }
    if let Some(fenced) = fenced_block(text) {
        candidates.push(fenced);
    }
    candidates.push(text.trim().to_string());

    let mut last_err = String::from("empty output");
    for candidate in &candidates {
        match serde_json::from_str::<T>(candidate) {
            Ok(parsed) => return Ok(parsed),
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(ExtractError::Unparsable { detail: last_err })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        value: i32,
    }

    #[test]
    fn prefers_tagged_block_over_fence() {
        let text = "Here you go:\n<answer>{\"value\": 1}</answer>\n```json\n{\"value\": 2}\n```";
        let parsed: Payload = parse_payload(text, "answer").unwrap();
        assert_eq!(parsed, Payload { value: 1 });
    }

    #[test]
    fn falls_back_to_fenced_block() {
        let text = "Sure! The result is:\n```json\n{\"value\": 3}\n```\nLet me know.";
        let parsed: Payload = parse_payload(text, "answer").unwrap();
        assert_eq!(parsed, Payload { value: 3 });
    }

    #[test]
    fn falls_back_to_raw_text() {
        let parsed: Payload = parse_payload("  {\"value\": 4} ", "answer").unwrap();
        assert_eq!(parsed, Payload { value: 4 });
    }

    #[test]
    fn unwraps_nested_tags() {
        let text = "<answer>noise <answer>{\"value\": 5}</answer></answer>";
        let parsed: Payload = parse_payload(text, "answer").unwrap();
        assert_eq!(parsed, Payload { value: 5 });
    }

    #[test]
    fn nested_tags_with_surrounding_prose() {
        let text = "Model output follows.\n\
            <answer>draft below <answer>{\"value\": 7}</answer></answer>\nDone.";
        assert_eq!(tagged_block(text, "answer").as_deref(), Some("{\"value\": 7}"));
        let parsed: Payload = parse_payload(text, "answer").unwrap();
        assert_eq!(parsed, Payload { value: 7 });
    }

    #[test]
    fn fence_inside_tag_is_tried_first() {
        let text = "<answer>\n```json\n{\"value\": 6}\n```\n</answer>";
        let parsed: Payload = parse_payload(text, "answer").unwrap();
        assert_eq!(parsed, Payload { value: 6 });
    }

    #[test]
    fn unparsable_output_is_a_typed_error() {
        let err = parse_payload::<Payload>("I could not produce JSON, sorry.", "answer")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Unparsable { .. }));
    }
}
