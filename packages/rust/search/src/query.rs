//! Search query construction.
//!
//! The entity name is always searched as an exact phrase. Domain guesses are
//! derived from the name with corporate suffixes stripped, so `Acme Labs Inc.`
//! yields `acme.com`, `acme.ai`, `acme.io`.

use std::sync::LazyLock;

use regex::Regex;

/// Trailing legal/corporate designators removed before slugging.
static SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)[\s,]+(inc|incorporated|llc|l\.l\.c|ltd|limited|corp|corporation|co|company|gmbh|ag|sa|plc|labs?|technologies|technology|tech|ai|hq|group|holdings|systems|software)\.?$",
    )
    .expect("suffix regex is valid")
});

const GUESS_TLDS: [&str; 3] = ["com", "ai", "io"];

/// The entity name with trailing corporate suffixes removed, lowercased.
///
/// Falls back to the full (lowercased, trimmed) name if stripping would leave
/// nothing.
pub fn core_name(name: &str) -> String {
    let mut current = name.split_whitespace().collect::<Vec<_>>().join(" ");
    loop {
        let stripped = SUFFIX_RE.replace(&current, "").trim().to_string();
        if stripped.is_empty() || stripped == current {
            break;
        }
        current = stripped;
    }
    current
        .trim_end_matches(|c: char| c == ',' || c == '.')
        .to_lowercase()
}

/// ASCII-alphanumeric slug of the core name.
fn slug(name: &str) -> String {
    core_name(name)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Candidate company domains, in fixed order. Empty when the name has no
/// ASCII alphanumerics.
pub fn domain_guesses(name: &str) -> Vec<String> {
    let slug = slug(name);
    if slug.is_empty() {
        return Vec::new();
    }
    GUESS_TLDS.iter().map(|tld| format!("{slug}.{tld}")).collect()
}

/// Build the provider query for an entity.
pub fn build_query(name: &str, with_domain_guesses: bool) -> String {
    let phrase = name.split_whitespace().collect::<Vec<_>>().join(" ").replace('"', "");
    let mut query = format!("\"{phrase}\"");
    if with_domain_guesses {
        for domain in domain_guesses(name) {
            query.push(' ');
            query.push_str(&domain);
        }
    }
    query
}
