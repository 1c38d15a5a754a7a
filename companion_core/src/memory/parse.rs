//! Text shaping around the consolidation prompts: transcript rendering on the way in,
//! a tolerant grammar for model output on the way out.
//!
//! Numbered list grammar, one entry per line:
//!
//! ```text
//! line    := ws* ordinal? ws* content ws*
//! ordinal := digit+ ws* ( "." | "．" | "、" | ")" | "）" )
//! ```
//!
//! Blank lines and entries longer than the character budget are dropped.

use crate::history::{Turn, TurnRole};

const ORDINAL_TERMINATORS: [char; 5] = ['.', '．', '、', ')', '）'];

/// Role-prefixed transcript, one line per turn.
pub fn render_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| match turn.role {
            TurnRole::Event => format!("[event] {}", turn.content),
            TurnRole::User => format!("User: {}", turn.content),
            TurnRole::Assistant => format!("Companion: {}", turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First `max_chars` Unicode scalar values of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Normalize a single-sentence distillation. Over-long replies are cut, empty ones rejected.
pub fn clean_distillation(raw: &str, max_chars: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let length = trimmed.chars().count();
    if length > max_chars {
        tracing::warn!(
            "Distilled memory is {} characters (limit {}), truncating",
            length,
            max_chars
        );
    }
    let cut = truncate_chars(trimmed, max_chars);
    let cut = cut.trim();
    (!cut.is_empty()).then(|| cut.to_string())
}

/// Parse a numbered list reply into entries of at most `max_chars` characters.
pub fn parse_numbered_list(raw: &str, max_chars: usize) -> Vec<String> {
    raw.lines()
        .map(|line| strip_ordinal(line.trim()).trim())
        .filter(|entry| !entry.is_empty())
        .filter(|entry| {
            let fits = entry.chars().count() <= max_chars;
            if !fits {
                tracing::debug!("Dropping over-long compressed memory: {}", entry);
            }
            fits
        })
        .map(str::to_string)
        .collect()
}

fn strip_ordinal(line: &str) -> &str {
    let digits_end = line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(line.len());
    if digits_end == 0 {
        return line;
    }
    let rest = line[digits_end..].trim_start();
    match rest.chars().next() {
        Some(c) if ORDINAL_TERMINATORS.contains(&c) => &rest[c.len_utf8()..],
        // "1" alone or "2024 was fun": no terminator, keep the whole line
        _ if rest.is_empty() => "",
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::now_timestamp;

    fn turn(role: TurnRole, content: &str) -> Turn {
        Turn {
            id: 0,
            timestamp: now_timestamp(),
            role,
            content: content.to_string(),
            affinity_delta: None,
            resulting_score: None,
        }
    }

    #[test]
    fn transcript_prefixes_each_role_distinctly() {
        let text = render_transcript(&[
            turn(TurnRole::User, "hi"),
            turn(TurnRole::Assistant, "hello"),
            turn(TurnRole::Event, "Mika poked Pet"),
        ]);
        assert_eq!(text, "User: hi\nCompanion: hello\n[event] Mika poked Pet");
    }

    #[test]
    fn distillation_is_truncated_not_rejected() {
        let raw = "  Mika adopted a grey cat  \n";
        assert_eq!(
            clean_distillation(raw, 15).as_deref(),
            Some("Mika adopted a")
        );
        assert_eq!(
            clean_distillation("用户喜欢在深夜一边听音乐一边写代码和画画", 15).as_deref(),
            Some("用户喜欢在深夜一边听音乐一边写")
        );
        assert_eq!(clean_distillation(" \n ", 15), None);
    }

    #[test]
    fn twenty_character_reply_keeps_first_fifteen() {
        let raw = "abcdefghijklmnopqrst";
        assert_eq!(clean_distillation(raw, 15).as_deref(), Some("abcdefghijklmno"));
    }

    #[test]
    fn numbered_list_strips_ordinals_and_filters() {
        let raw = "1. likes tea\n2、works nights\n\n3) has a cat named Miso and two dogs\n4．moved city\nno ordinal\n10. plays go";
        assert_eq!(
            parse_numbered_list(raw, 15),
            vec!["likes tea", "works nights", "moved city", "no ordinal", "plays go"]
        );
    }

    #[test]
    fn ordinal_grammar_edge_cases() {
        assert_eq!(strip_ordinal("2024 was fun"), "2024 was fun");
        assert_eq!(strip_ordinal("7 . spaced"), " spaced");
        assert_eq!(strip_ordinal("3."), "");
        assert_eq!(strip_ordinal("12"), "");
        assert_eq!(strip_ordinal("plain"), "plain");
    }
}
