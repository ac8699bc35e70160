//! Locating the JSON payload inside free-form model output.

use serde_json::{Map, Value};

/// The first complete JSON object embedded in `text`.
///
/// Models often wrap JSON in code fences, or put reasoning before it that
/// contains stray braces. Each `{` is tried in order and the first one that
/// starts a well-formed object wins. Nothing is repaired.
pub fn extract_json_object(text: &str) -> Option<&str> {
    text.match_indices('{').find_map(|(start, _)| {
        let rest = &text[start..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Map<String, Value>>();
        match stream.next() {
            Some(Ok(_)) => Some(&rest[..stream.byte_offset()]),
            _ => None,
        }
    })
}
