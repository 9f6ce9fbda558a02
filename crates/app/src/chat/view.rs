//! Plain-text rendering of message bubbles and the session sidebar.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use console::style;
use tinychat_storage::{MessageRecord, MessageRole, SessionId, SessionSummary};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d | %I:%M %p";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Sidebar titles and auto-generated session titles are cut to this many chars.
pub const TITLE_MAX_CHARS: usize = 30;

const DAY_MILLIS: u64 = 60 * 60 * 24 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAgeGroup {
    Today,
    Yesterday,
    Older,
}

impl SessionAgeGroup {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::Yesterday => "Yesterday",
            Self::Older => "Older",
        }
    }
}

/// Cuts `text` to `max_chars` characters, appending `...` when anything was dropped.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }

    let mut truncated = single_line.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

pub fn format_timestamp(unix_ms: u64) -> String {
    format_local(unix_ms, TIMESTAMP_FORMAT)
}

pub fn format_date(unix_ms: u64) -> String {
    format_local(unix_ms, DATE_FORMAT)
}

fn format_local(unix_ms: u64, pattern: &str) -> String {
    i64::try_from(unix_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|timestamp| timestamp.with_timezone(&Local).format(pattern).to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn classify_group(created_at_unix_ms: u64, now_unix_ms: u64) -> SessionAgeGroup {
    let age_millis = now_unix_ms.saturating_sub(created_at_unix_ms);

    // Elapsed-time buckets, so grouping does not depend on the local timezone.
    if age_millis < DAY_MILLIS {
        SessionAgeGroup::Today
    } else if age_millis < DAY_MILLIS * 2 {
        SessionAgeGroup::Yesterday
    } else {
        SessionAgeGroup::Older
    }
}

pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// One bubble: a numbered role header with its timestamp, then the indented content.
pub fn render_message(position: usize, message: &MessageRecord) -> String {
    let label = match message.role {
        MessageRole::User => style("You").green().bold(),
        MessageRole::Assistant => style("Assistant").cyan().bold(),
    };
    let header = format!(
        "  {} {} {}",
        style(format!("[{position}]")).dim(),
        label,
        style(format_timestamp(message.created_at_unix_ms)).dim()
    );

    let body = message
        .content
        .lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!("{header}\n{body}")
}

pub fn render_conversation(messages: &[MessageRecord]) -> String {
    if messages.is_empty() {
        return format!("  {}", style("No messages yet. Say hello!").dim());
    }

    messages
        .iter()
        .enumerate()
        .map(|(index, message)| render_message(index + 1, message))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Sessions must arrive newest first; numbering follows that order.
pub fn render_sidebar(
    sessions: &[SessionSummary],
    current: Option<SessionId>,
    now_unix_ms: u64,
) -> String {
    if sessions.is_empty() {
        return format!(
            "  {}",
            style("No chats yet. Type a message or /new to start one.").dim()
        );
    }

    let mut lines = Vec::new();
    let mut active_group = None;

    for (index, session) in sessions.iter().enumerate() {
        let group = classify_group(session.created_at_unix_ms, now_unix_ms);
        if active_group != Some(group) {
            if active_group.is_some() {
                lines.push(String::new());
            }
            lines.push(format!("  {}", style(group.label()).bold()));
            active_group = Some(group);
        }

        let marker = if current == Some(session.id) { "*" } else { " " };
        lines.push(format!(
            "  {marker} {} {} {} {}",
            style(format!("{:>2}.", index + 1)).dim(),
            truncate_chars(session.display_title(), TITLE_MAX_CHARS),
            style(format_date(session.last_active_unix_ms())).dim(),
            style(format!("({} msgs)", session.message_count)).dim(),
        ));
    }

    lines.join("\n")
}

pub fn render_search_results(query: &str, results: &[MessageRecord]) -> String {
    if results.is_empty() {
        return format!("  No messages match {}", style(format!("\"{query}\"")).yellow());
    }

    results
        .iter()
        .map(|message| {
            format!(
                "  {} {} {}",
                style(format_timestamp(message.created_at_unix_ms)).dim(),
                style(message.role).bold(),
                truncate_chars(&message.content, 80)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use console::strip_ansi_codes;
    use tinychat_storage::MessageId;

    use super::*;

    fn summary(title: Option<&str>, preview: Option<&str>, created_at_unix_ms: u64) -> SessionSummary {
        SessionSummary {
            id: SessionId::new_v7(),
            title: title.map(str::to_string),
            created_at_unix_ms,
            message_count: 2,
            preview: preview.map(str::to_string),
            last_message_at_unix_ms: None,
        }
    }

    #[test]
    fn truncate_chars_appends_ellipsis_only_when_cut() {
        assert_eq!(truncate_chars("short", 30), "short");
        assert_eq!(
            truncate_chars("Tell me about artificial intelligence", 30),
            "Tell me about artificial intel..."
        );
        assert_eq!(truncate_chars("line one\nline two", 30), "line one line two");
    }

    #[test]
    fn truncate_chars_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn classify_group_uses_elapsed_days() {
        let now = 10 * DAY_MILLIS;
        assert_eq!(classify_group(now - 1_000, now), SessionAgeGroup::Today);
        assert_eq!(classify_group(now - DAY_MILLIS, now), SessionAgeGroup::Yesterday);
        assert_eq!(classify_group(now - 3 * DAY_MILLIS, now), SessionAgeGroup::Older);
        assert_eq!(classify_group(now + 5_000, now), SessionAgeGroup::Today);
    }

    #[test]
    fn timestamp_formats_match_layout() {
        let rendered = format_timestamp(1_700_000_000_000);
        assert_eq!(rendered.len(), "2023-11-14 | 10:13 PM".len());
        assert!(rendered.contains(" | "));
        assert!(rendered.ends_with("AM") || rendered.ends_with("PM"));
        assert_eq!(format_date(1_700_000_000_000).len(), "2023-11-14".len());
    }

    #[test]
    fn sidebar_groups_and_numbers_sessions() {
        let now = 10 * DAY_MILLIS;
        let sessions = vec![
            summary(Some("Rust questions"), None, now - 1_000),
            summary(None, Some("How does machine learning work in practice?"), now - DAY_MILLIS),
            summary(None, None, now - 5 * DAY_MILLIS),
        ];

        let rendered = strip_ansi_codes(&render_sidebar(&sessions, Some(sessions[0].id), now))
            .to_string();

        let today = rendered.find("Today").expect("today header");
        let yesterday = rendered.find("Yesterday").expect("yesterday header");
        let older = rendered.find("Older").expect("older header");
        assert!(today < yesterday && yesterday < older);
        assert!(rendered.contains("*  1. Rust questions"));
        assert!(rendered.contains(" 2. How does machine learning work..."));
        assert!(rendered.contains(" 3. New Chat"));
    }

    #[test]
    fn empty_sidebar_has_hint() {
        let rendered = strip_ansi_codes(&render_sidebar(&[], None, 0)).to_string();
        assert!(rendered.contains("/new"));
    }

    #[test]
    fn message_bubble_shows_role_and_indented_content() {
        let message = MessageRecord {
            id: MessageId::new_v7(),
            session_id: SessionId::new_v7(),
            seq: 1,
            role: MessageRole::Assistant,
            content: "first\nsecond".to_string(),
            created_at_unix_ms: 1_700_000_000_000,
        };

        let rendered = strip_ansi_codes(&render_message(2, &message)).to_string();
        assert!(rendered.starts_with("  [2] Assistant "));
        assert!(rendered.contains("\n    first\n    second"));
    }
}
