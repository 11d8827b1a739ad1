use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::{Tool, ToolError};

const DEFAULT_LIMIT: usize = 5;

/// A note file whose name carries a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFile {
    pub path: PathBuf,
    pub date: NaiveDate,
}

/// A note read from disk.
#[derive(Debug, Clone)]
pub struct Note {
    pub date: NaiveDate,
    pub path: PathBuf,
    pub title: Option<String>,
    pub content: String,
}

/// Raw YAML frontmatter structure for deserialization.
#[derive(Debug, Deserialize)]
struct Frontmatter {
    title: Option<String>,
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("valid date regex"))
}

/// First `YYYY-MM-DD` in the file name that is a real calendar date.
fn date_from_filename(name: &str) -> Option<NaiveDate> {
    date_pattern()
        .find_iter(name)
        .find_map(|m| NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok())
}

/// List dated note files, oldest first.
pub fn find_note_files(notes_dir: &Path) -> Vec<DateFile> {
    let entries = match std::fs::read_dir(notes_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::info!("NotesReader: cannot read {}: {}", notes_dir.display(), e);
            return Vec::new();
        }
    };

    let mut files: Vec<DateFile> = entries
        .filter_map(|entry| match entry {
            Ok(e) => Some(e.path()),
            Err(e) => {
                log::warn!("NotesReader: failed to read dir entry: {}", e);
                None
            }
        })
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let date = date_from_filename(name)?;
            Some(DateFile { path, date })
        })
        .collect();

    files.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));
    files
}

/// Split YAML frontmatter between `---` markers from the body.
fn split_frontmatter(content: &str) -> (Option<Frontmatter>, &str) {
    let trimmed = content.trim_start();
    let Some(after_first) = trimmed.strip_prefix("---") else {
        return (None, content);
    };
    let Some(end) = after_first.find("\n---") else {
        return (None, content);
    };

    let yaml_str = &after_first[..end];
    let body = &after_first[end + 4..];
    match serde_yaml::from_str::<Frontmatter>(yaml_str) {
        Ok(fm) => (Some(fm), body),
        Err(_) => (None, content),
    }
}

/// Read the given files; unreadable ones are skipped.
pub fn read_notes(files: &[DateFile]) -> Vec<Note> {
    files
        .iter()
        .filter_map(|df| match std::fs::read_to_string(&df.path) {
            Ok(content) => {
                let (frontmatter, body) = split_frontmatter(&content);
                Some(Note {
                    date: df.date,
                    path: df.path.clone(),
                    title: frontmatter.and_then(|fm| fm.title),
                    content: body.trim().to_string(),
                })
            }
            Err(e) => {
                log::warn!("NotesReader: failed to read {}: {}", df.path.display(), e);
                None
            }
        })
        .collect()
}

pub fn format_notes(notes: &[Note]) -> String {
    notes
        .iter()
        .enumerate()
        .map(|(idx, note)| {
            let header = match &note.title {
                Some(title) => format!("Note {} ({}): {}", idx + 1, note.date, title),
                None => format!("Note {} ({})", idx + 1, note.date),
            };
            format!("{}\n{}", header, note.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The `limit` most recent notes as text, oldest first.
pub fn recent_notes(notes_dir: &Path, limit: usize) -> String {
    let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
    let files = find_note_files(notes_dir);
    if files.is_empty() {
        return "No notes found.".to_string();
    }

    let selected = &files[files.len().saturating_sub(limit)..];
    let notes = read_notes(selected);
    for note in &notes {
        log::debug!("NotesReader: selected {}", note.path.display());
    }
    log::info!("NotesReader: returning {} of {} notes", notes.len(), files.len());
    format_notes(&notes)
}

/// Agent tool returning the most recent dated notes.
pub struct NotesTool {
    notes_dir: PathBuf,
    default_limit: usize,
}

impl NotesTool {
    pub fn new(notes_dir: PathBuf, default_limit: usize) -> Self {
        Self { notes_dir, default_limit }
    }

    fn requested_count(&self, args: &Value) -> usize {
        let requested = match args {
            Value::Object(map) => map.get("count").and_then(Value::as_i64),
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        match requested {
            Some(n) if n > 0 => n as usize,
            _ => self.default_limit,
        }
    }
}

#[async_trait::async_trait]
impl Tool for NotesTool {
    fn name(&self) -> &str {
        "notes"
    }

    fn description(&self) -> &str {
        "Fetch the most recent dated notes from the notes directory. \
         Pass `count` to control how many to return."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": { "type": "integer", "description": "How many notes to fetch" }
            }
        })
    }

    async fn run(&self, args: Value) -> Result<String, ToolError> {
        let count = self.requested_count(&args);
        let dir = self.notes_dir.clone();
        tokio::task::spawn_blocking(move || recent_notes(&dir, count))
            .await
            .map_err(|e| ToolError::Failed(format!("notes task: {}", e)))
    }
}
