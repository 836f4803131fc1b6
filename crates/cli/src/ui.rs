use std::io::{self, IsTerminal};

use chrono::DateTime;
use core_model::{Message, Risk, ThreadSummary};
use owo_colors::OwoColorize;

pub fn color_enabled() -> bool {
    io::stdout().is_terminal()
        && io::stderr().is_terminal()
        && std::env::var_os("NO_COLOR").is_none()
}

pub fn truncate_text(input: &str, max: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max {
            out.push_str("...");
            return out;
        }
        out.push(ch);
    }
    out
}

pub fn format_ts(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn paint(text: String, use_color: bool, f: impl FnOnce(&str) -> String) -> String {
    if use_color { f(&text) } else { text }
}

pub fn print_thread_list(threads: &[ThreadSummary]) {
    let use_color = color_enabled();
    let separator = paint(" | ".to_string(), use_color, |s| s.dimmed().to_string());
    for thread in threads {
        let key = paint(thread.thread_key.clone(), use_color, |s| s.bold().to_string());
        let peer = paint(thread.peer_address.clone(), use_color, |s| s.cyan().to_string());
        let count = paint(
            format!("{} msgs, {} unread", thread.message_count, thread.unread_count),
            use_color,
            |s| s.magenta().to_string(),
        );
        let date = paint(format_ts(thread.last_timestamp), use_color, |s| {
            s.dimmed().to_string()
        });
        let snippet = truncate_text(&thread.last_snippet.replace('\n', " "), 80);
        let flag = if thread.thread_risk {
            paint("RISK ".to_string(), use_color, |s| s.red().bold().to_string())
        } else {
            String::new()
        };
        println!(
            "{flag}[{key}] {peer}{separator}{count}{separator}{date}{separator}{snippet}"
        );
    }
}

pub fn print_messages(messages: &[Message]) {
    let use_color = color_enabled();
    for m in messages {
        let date = paint(format_ts(m.timestamp), use_color, |s| s.dimmed().to_string());
        let unread = if m.is_read { " " } else { "*" };
        let risk = match &m.risk {
            Risk::Unscored => String::new(),
            Risk::Scored { score, reason } => paint(
                format!(" risk={score:.2} ({reason})"),
                use_color,
                |s| s.yellow().to_string(),
            ),
        };
        println!(
            "{unread} {} {date} [{}] {} {}: {}{risk}",
            m.id,
            m.kind,
            m.thread_key,
            m.sender,
            truncate_text(&m.body.replace('\n', " "), 120)
        );
    }
}
