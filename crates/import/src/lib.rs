//! Bulk loading of exported message logs (JSON lines) into a store.
//!
//! Each line is one message: `{"address", "body", "date", "type", "read"}`.
//! `sender`, `timestamp` and `kind` are accepted as aliases. Lines that are
//! not JSON objects or carry no usable date are skipped and counted.

use std::{fs, path::Path};

use core_model::MessageKind;
use rayon::prelude::*;
use serde_json::Value;
use store_sqlite::{NewMessage, SqliteStore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Discovering,
    Parsing { file_count: usize },
    Saving { row_count: usize },
    Done { inserted: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub files: usize,
    pub parsed: usize,
    pub skipped: usize,
    pub inserted: usize,
}

pub fn collect_files_with_ext(root: &Path, ext: &str) -> Vec<String> {
    if root.is_file() {
        return vec![root.to_string_lossy().into_owned()];
    }
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some(ext)
                && let Some(s) = path.to_str()
            {
                out.push(s.to_string());
            }
        }
    }
    out.sort();
    out
}

/// Parses one exported line. `None` when the line cannot become a row.
pub fn parse_line(line: &str) -> Option<NewMessage> {
    let value: Value = serde_json::from_str(line).ok()?;
    if !value.is_object() {
        return None;
    }
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .map(ToOwned::to_owned)
    };
    let timestamp = ["date", "timestamp"].iter().find_map(|k| {
        let v = value.get(*k)?;
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })?;
    let kind = text(&["type", "kind"])
        .and_then(|k| k.parse::<MessageKind>().ok())
        .unwrap_or_default();
    let is_read = match value.get("read") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    };
    Some(NewMessage {
        sender: text(&["address", "sender"]),
        body: text(&["body"]),
        timestamp,
        kind,
        is_read,
    })
}

/// Reads every file in parallel. Rows come back sorted oldest first so
/// thread ids are allocated in delivery order.
pub fn load_jsonl(paths: &[String]) -> (Vec<NewMessage>, usize) {
    let per_file: Vec<(Vec<NewMessage>, usize)> = paths
        .par_iter()
        .map(|path| {
            let content = match fs::read_to_string(path) {
                Ok(c) => c,
                Err(err) => {
                    warn!(path = %path, error = %err, "skipping unreadable file");
                    return (Vec::new(), 0);
                }
            };
            let mut rows = Vec::new();
            let mut skipped = 0;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match parse_line(line) {
                    Some(row) => rows.push(row),
                    None => skipped += 1,
                }
            }
            debug!(path = %path, rows = rows.len(), skipped, "parsed export file");
            (rows, skipped)
        })
        .collect();

    let mut rows = Vec::new();
    let mut skipped = 0;
    for (r, s) in per_file {
        rows.extend(r);
        skipped += s;
    }
    rows.sort_by_key(|r| r.timestamp);
    (rows, skipped)
}

pub fn import_path(
    root: &Path,
    store: &mut SqliteStore,
    on_progress: impl Fn(ImportPhase),
) -> anyhow::Result<ImportReport> {
    on_progress(ImportPhase::Discovering);
    let files = collect_files_with_ext(root, "jsonl");
    if files.is_empty() {
        anyhow::bail!("no .jsonl files under {}", root.display());
    }

    on_progress(ImportPhase::Parsing {
        file_count: files.len(),
    });
    let (rows, skipped) = load_jsonl(&files);
    if skipped > 0 {
        warn!(skipped, "some export lines were not usable");
    }

    on_progress(ImportPhase::Saving {
        row_count: rows.len(),
    });
    let inserted = store.import(&rows)?;

    on_progress(ImportPhase::Done { inserted });
    Ok(ImportReport {
        files: files.len(),
        parsed: rows.len(),
        skipped,
        inserted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::MessageStore;
    use std::sync::Mutex;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sms-import-{name}-{}-{}",
            std::process::id(),
            nanos()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn nanos() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }

    fn memory_store() -> SqliteStore {
        let store = SqliteStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        store
    }

    #[test]
    fn parse_line_reads_export_fields() {
        let row = parse_line(
            r#"{"address":"+15551234567","body":"hi","date":1000,"type":"MMS","read":1}"#,
        )
        .unwrap();
        assert_eq!(row.sender.as_deref(), Some("+15551234567"));
        assert_eq!(row.body.as_deref(), Some("hi"));
        assert_eq!(row.timestamp, 1000);
        assert_eq!(row.kind, MessageKind::Mms);
        assert!(row.is_read);
    }

    #[test]
    fn parse_line_tolerates_missing_text() {
        let row = parse_line(r#"{"date":"42"}"#).unwrap();
        assert_eq!(row.sender, None);
        assert_eq!(row.body, None);
        assert_eq!(row.timestamp, 42);
        assert_eq!(row.kind, MessageKind::Sms);
        assert!(!row.is_read);
    }

    #[test]
    fn parse_line_rejects_unusable() {
        assert!(parse_line("not json").is_none());
        assert!(parse_line("[1,2]").is_none());
        assert!(parse_line(r#"{"address":"+1","body":"no date"}"#).is_none());
    }

    #[test]
    fn collect_files_recurses_and_sorts() {
        let dir = temp_dir("collect");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("b.jsonl"), "").unwrap();
        fs::write(dir.join("nested/a.jsonl"), "").unwrap();
        fs::write(dir.join("notes.txt"), "").unwrap();
        let files = collect_files_with_ext(&dir, "jsonl");
        assert_eq!(files.len(), 2);
        assert!(files.windows(2).all(|w| w[0] <= w[1]));
        let single = collect_files_with_ext(&dir.join("b.jsonl"), "jsonl");
        assert_eq!(single.len(), 1);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn import_is_idempotent_and_threads_by_address() {
        let dir = temp_dir("import");
        fs::write(
            dir.join("export.jsonl"),
            concat!(
                r#"{"address":"+1","body":"first","date":10,"type":"SMS","read":true}"#,
                "\n",
                "garbage\n",
                "\n",
                r#"{"address":"+1","body":"second","date":20}"#,
                "\n",
                r#"{"address":"+2","body":"other","date":15}"#,
                "\n",
            ),
        )
        .unwrap();

        let mut store = memory_store();
        let phases = Mutex::new(Vec::new());
        let report = import_path(&dir, &mut store, |p| phases.lock().unwrap().push(p)).unwrap();
        assert_eq!(
            report,
            ImportReport {
                files: 1,
                parsed: 3,
                skipped: 1,
                inserted: 3
            }
        );
        let phases = phases.into_inner().unwrap();
        assert_eq!(phases.first(), Some(&ImportPhase::Discovering));
        assert_eq!(phases.last(), Some(&ImportPhase::Done { inserted: 3 }));

        let again = import_path(&dir, &mut store, |_| {}).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(store.message_count().unwrap(), 3);

        let all = store.load_all().unwrap();
        let first = all.iter().find(|m| m.body == "first").unwrap();
        let second = all.iter().find(|m| m.body == "second").unwrap();
        let other = all.iter().find(|m| m.body == "other").unwrap();
        assert_eq!(first.thread_key, second.thread_key);
        assert_ne!(first.thread_key, other.thread_key);
        assert!(first.is_read);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn import_without_files_fails() {
        let dir = temp_dir("empty");
        let mut store = memory_store();
        assert!(import_path(&dir, &mut store, |_| {}).is_err());
        fs::remove_dir_all(dir).unwrap();
    }
}
