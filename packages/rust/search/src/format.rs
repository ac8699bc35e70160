//! Evidence formatting and size-bounded truncation.

use crate::provider::SearchHit;

/// First line of every formatted evidence document, followed by the entity name.
pub const RESULTS_HEADER: &str = "# Search Results for:";

/// Render hits as markdown, one section per source, in the given order.
pub fn format_results(entity_name: &str, hits: &[SearchHit]) -> String {
    let mut out = format!("{RESULTS_HEADER} {entity_name}\n");
    for (i, hit) in hits.iter().enumerate() {
        let title = if hit.title.trim().is_empty() {
            "Untitled"
        } else {
            hit.title.trim()
        };
        out.push_str(&format!(
            "\n## Source {}: {title}\nURL: {}\nRelevance: {:.2}\n\n{}\n",
            i + 1,
            hit.url,
            hit.score,
            hit.body().trim()
        ));
    }
    out
}

fn marker(original: usize, kept: usize) -> String {
    format!("\n[truncated: original {original} bytes, kept {kept} bytes]")
}

/// Largest char boundary `<= idx`.
fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Cap `text` at `max_bytes`, keeping the leading portion.
///
/// The cut lands on the last line boundary inside the budget. Only a window
/// with no newline at all falls back to whitespace. A marker line recording
/// the original and kept sizes is appended. Output never exceeds `max_bytes`
/// and is always valid UTF-8. Text that already fits is returned unchanged.
pub fn truncate_structured(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    // `kept` never has more digits than the original length.
    let reserve = marker(text.len(), text.len()).len();
    if max_bytes <= reserve {
        let cut = floor_char_boundary(text, max_bytes);
        return text[..cut].to_string();
    }

    let budget = floor_char_boundary(text, max_bytes - reserve);
    let window = &text[..budget];

    let cut = match window.rfind('\n') {
        Some(pos) => pos,
        None => match window.rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => pos,
            _ => budget,
        },
    };

    let kept = text[..cut].trim_end();
    let mut out = String::with_capacity(max_bytes);
    out.push_str(kept);
    out.push_str(&marker(text.len(), kept.len()));
    out
}
