use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

pub const TITLE_BUDGET: usize = 80;
pub const TRUNCATION_MARKER: &str = "...";
pub const HASHTAGS: &str = "#brainrot #shorts";
pub const TAGS: [&str; 3] = ["brainrot", "shorts", "absurd"];

static FIRST_SENTENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^.!?]*[.!?]+").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// Title, description and tags for a generated story. Pure.
pub fn build_metadata(story: &str) -> Metadata {
    let story = story.trim();
    let description = if story.is_empty() {
        HASHTAGS.to_string()
    } else {
        format!("{story}\n\n{HASHTAGS}")
    };
    Metadata {
        title: build_title(story),
        description,
        tags: TAGS.iter().map(|t| t.to_string()).collect(),
    }
}

fn build_title(story: &str) -> String {
    let first_line = story.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let sentence = FIRST_SENTENCE
        .find(first_line)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(first_line);

    if sentence.chars().count() <= TITLE_BUDGET {
        return sentence.to_string();
    }
    let keep = TITLE_BUDGET - TRUNCATION_MARKER.chars().count();
    let mut title: String = sentence.chars().take(keep).collect();
    title.push_str(TRUNCATION_MARKER);
    title
}
