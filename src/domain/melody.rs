use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

const TITLE_MAX_CHARS: usize = 50;
const MIN_SUGGESTION_CHARS: usize = 3;

static INTENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.*?)(?:need to|have to|should|must|want to|plan to)\s+(.+)$")
        .expect("valid intent pattern")
});

static LEADING_VERB_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(buy|get|call|email|text|visit|schedule|book|make|do|finish|complete|start|begin)\s+(.+)$",
    )
    .expect("valid leading verb pattern")
});

static DEADLINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.+?)\s+(?:by|before|until)\s+(.+)$").expect("valid deadline pattern")
});

static BULLET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-•*]\s*(.+)$").expect("valid bullet pattern"));

static TASK_WORD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(remember|check|review|update|send|plan|organize|clean|fix|repair|install|download|upload|print|scan|write|read|study|practice|exercise|cook|prepare|wash|fold|vacuum|water|feed|walk|drive|pick up|drop off|return|cancel|confirm|pay|order|ship|meet|attend|pack|sort|file|backup|charge|reply|ask|research|test|finish|book|call|buy)\b",
    )
    .expect("valid task word pattern")
});

/// Splits a free-form capture into candidate task titles, in order of
/// appearance and without duplicates.
pub fn extract_task_suggestions(content: &str) -> Vec<String> {
    let mut suggestions = Vec::new();

    for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(suggestion) = match_line(line) {
            suggestions.push(suggestion);
            continue;
        }

        let length = line.chars().count();
        if length > 5 && length < 100 && TASK_WORD_PATTERN.is_match(line) {
            suggestions.push(line.to_string());
        }
    }

    let mut seen = HashSet::new();
    suggestions
        .into_iter()
        .filter(|suggestion| suggestion.chars().count() >= MIN_SUGGESTION_CHARS)
        .filter(|suggestion| seen.insert(suggestion.clone()))
        .collect()
}

fn match_line(line: &str) -> Option<String> {
    for pattern in [&*INTENT_PATTERN, &*LEADING_VERB_PATTERN, &*DEADLINE_PATTERN] {
        if let Some(captures) = pattern.captures(line) {
            let joined = [captures.get(1), captures.get(2)]
                .into_iter()
                .flatten()
                .map(|value| value.as_str().trim())
                .filter(|value| !value.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            return Some(joined);
        }
    }
    BULLET_PATTERN
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().trim().to_string())
}

pub fn suggested_title(content: &str) -> String {
    let content = content.trim();
    if content.chars().count() <= TITLE_MAX_CHARS {
        return content.to_string();
    }
    let truncated = content.chars().take(TITLE_MAX_CHARS).collect::<String>();
    format!("{truncated}...")
}

pub fn processing_notes(suggestion_count: usize) -> String {
    format!("Extracted {suggestion_count} potential tasks")
}
