//! Fenced code block extraction from model output.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::language::Language;
use crate::core::types::CodeFragment;

/// Tag assumed for fences that carry no language.
const UNTAGGED: &str = "text";

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([A-Za-z0-9_+.\-]*)[^\n]*\n(.*?)^[ \t]*```[ \t]*$")
        .expect("fence regex should be valid")
});

/// Extract every non-empty fenced block in document order.
pub fn extract_fragments(text: &str) -> Vec<CodeFragment> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let tag = caps.get(1).map_or("", |m| m.as_str());
            let body = caps.get(2).map_or("", |m| m.as_str());
            let source = body.trim_matches(['\n', '\r']);
            if source.trim().is_empty() {
                return None;
            }
            let tag = if tag.is_empty() { UNTAGGED } else { tag };
            Some(CodeFragment {
                language: Language::from_tag(tag),
                source: source.to_string(),
                origin_line: line_of(text, whole.start()),
            })
        })
        .collect()
}

/// Fragments in `text` whose language matches `language`, in order.
pub fn fragments_in(text: &str, language: &Language) -> Vec<CodeFragment> {
    extract_fragments(text)
        .into_iter()
        .filter(|fragment| &fragment.language == language)
        .collect()
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}
