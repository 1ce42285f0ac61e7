//! Conflict resolution support.
//!
//! When the server reports a concurrent edit the client offers the user a
//! choice. Recognized text files get a three-way merge seeded with inline
//! conflict markers; everything else is a binary pick between the local and
//! server copies. Dispatching the chosen outcome back through the sync
//! pipeline lives in the queue; this module holds the pure parts.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker opening the local side of a merge seed.
pub const LOCAL_MARKER: &str = "<<<<<<< LOCAL";

/// Marker separating the two sides.
pub const SEPARATOR_MARKER: &str = "=======";

/// Marker closing the server side.
pub const SERVER_MARKER: &str = ">>>>>>> SERVER";

/// Extensions treated as editable text and offered an inline merge.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "java", "py", "js", "ts", "html", "css", "xml", "json", "yml", "yaml",
    "properties", "cfg", "conf", "log", "sql", "sh", "bat", "csv", "ini", "gitignore",
    "dockerfile", "gradle", "maven", "rb", "php", "go", "rs", "cpp", "c", "h", "hpp", "cs", "vb",
    "scala", "kt",
];

/// Rich-document formats merged as text only when small enough to plausibly
/// be hand-edited markup.
const RICH_TEXT_EXTENSIONS: &[&str] = &["rtf", "odt"];

/// Size bound for the rich-document heuristic.
const RICH_TEXT_MAX_BYTES: u64 = 64 * 1024;

/// How the user resolved a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionChoice {
    /// Keep the local bytes; submit them as an accepted update.
    UseLocal,
    /// Take the server's current version; overwrite the local copy.
    UseServer,
    /// Write user-merged bytes locally and submit them.
    UseMerged(Vec<u8>),
    /// Leave everything as-is; the file stays in conflict.
    Cancelled,
}

/// A conflict awaiting user resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConflict {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_version_id: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Whether a file should be offered an inline text merge.
pub fn is_mergeable_text(path: &Path, file_size: u64) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_lowercase(),
        None => return false,
    };

    // Dotfiles like `.gitignore` have no extension in the Path sense; match
    // on the trailing segment after the last dot instead.
    let suffix = name.rsplit('.').next().unwrap_or("");

    if TEXT_EXTENSIONS.contains(&suffix) {
        return true;
    }
    RICH_TEXT_EXTENSIONS.contains(&suffix) && file_size <= RICH_TEXT_MAX_BYTES
}

/// Build the merge-pane seed from the two sides of a conflict.
///
/// The local content comes first, then the server content, wrapped in the
/// conventional conflict markers.
pub fn merge_seed(local: &str, server: &str) -> String {
    let mut seed = String::with_capacity(local.len() + server.len() + 64);
    seed.push_str(LOCAL_MARKER);
    seed.push('\n');
    seed.push_str(local);
    if !local.ends_with('\n') && !local.is_empty() {
        seed.push('\n');
    }
    seed.push_str(SEPARATOR_MARKER);
    seed.push('\n');
    seed.push_str(server);
    if !server.ends_with('\n') && !server.is_empty() {
        seed.push('\n');
    }
    seed.push_str(SERVER_MARKER);
    seed.push('\n');
    seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_common_text_extensions() {
        for name in ["a.txt", "b.md", "c.rs", "d.json", "e.PROPERTIES"] {
            assert!(
                is_mergeable_text(&PathBuf::from(name), 100),
                "{} should be text",
                name
            );
        }
    }

    #[test]
    fn test_dotfiles_match_trailing_segment() {
        assert!(is_mergeable_text(&PathBuf::from(".gitignore"), 50));
        assert!(is_mergeable_text(&PathBuf::from("app.dockerfile"), 50));
    }

    #[test]
    fn test_binary_extensions_rejected() {
        for name in ["photo.png", "song.mp3", "archive.zip", "noext"] {
            assert!(
                !is_mergeable_text(&PathBuf::from(name), 100),
                "{} should not be text",
                name
            );
        }
    }

    #[test]
    fn test_rich_text_heuristic_is_size_bound() {
        let path = PathBuf::from("letter.rtf");
        assert!(is_mergeable_text(&path, 10 * 1024));
        assert!(!is_mergeable_text(&path, 10 * 1024 * 1024));
    }

    #[test]
    fn test_merge_seed_structure() {
        let seed = merge_seed("local line\n", "server line\n");
        let lines: Vec<&str> = seed.lines().collect();

        assert_eq!(lines[0], LOCAL_MARKER);
        assert_eq!(lines[1], "local line");
        assert_eq!(lines[2], SEPARATOR_MARKER);
        assert_eq!(lines[3], "server line");
        assert_eq!(lines[4], SERVER_MARKER);
    }

    #[test]
    fn test_merge_seed_adds_missing_newlines() {
        let seed = merge_seed("no newline", "also none");
        assert!(seed.contains("no newline\n======="));
        assert!(seed.contains("also none\n>>>>>>>"));
    }

    #[test]
    fn test_merge_seed_empty_sides() {
        let seed = merge_seed("", "");
        let lines: Vec<&str> = seed.lines().collect();
        assert_eq!(lines, vec![LOCAL_MARKER, SEPARATOR_MARKER, SERVER_MARKER]);
    }
}
