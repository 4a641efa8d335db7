//! Relevance of text to the current focus topics.

use std::collections::HashSet;

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Fraction of `focus` topics present in `text`, in `[0, 1]`.
///
/// A topic is present when every one of its words appears. No focus means
/// nothing is off-topic, so the score is `1.0`.
pub fn score(text: &str, focus: &[String]) -> f32 {
    let topics: Vec<Vec<String>> = focus
        .iter()
        .map(|t| words(t).collect::<Vec<_>>())
        .filter(|t| !t.is_empty())
        .collect();
    if topics.is_empty() {
        return 1.0;
    }
    let vocabulary: HashSet<String> = words(text).collect();
    let hits = topics
        .iter()
        .filter(|topic| topic.iter().all(|w| vocabulary.contains(w)))
        .count();
    hits as f32 / topics.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn focus(topics: &[&str]) -> Vec<String> {
        topics.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_scores() {
        let text = "We discussed the Merge strategy and fork-point semantics.";
        assert_eq!(score(text, &focus(&["merge", "fork point"])), 1.0);
        assert_eq!(score(text, &focus(&["merge", "billing"])), 0.5);
        assert_eq!(score(text, &focus(&["billing"])), 0.0);
    }

    #[test]
    fn test_empty_focus_is_fully_relevant() {
        assert_eq!(score("anything", &[]), 1.0);
        assert_eq!(score("anything", &focus(&["  ", "--"])), 1.0);
    }
}
