pub mod compilation_feedback;
pub mod error_monitor;
pub mod test_feedback;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use compilation_feedback::{CompilationFeedback, CompilationSeverity};
pub use error_monitor::ErrorMonitor;
pub use test_feedback::{TestFeedback, TestSeverity};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CompilationErrorKind {
    Syntax,
    Import,
    Typescript,
    Runtime,
    Build,
}

impl CompilationErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            CompilationErrorKind::Syntax => "SYNTAX",
            CompilationErrorKind::Import => "IMPORT",
            CompilationErrorKind::Typescript => "TYPESCRIPT",
            CompilationErrorKind::Runtime => "RUNTIME",
            CompilationErrorKind::Build => "BUILD",
        }
    }
}

/// One error recognised in process output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompilationError {
    #[serde(rename = "type")]
    pub kind: CompilationErrorKind,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
    pub raw_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CompilationError {
    /// `file:line:column`, omitting what is unknown.
    pub fn location(&self) -> String {
        match (self.line, self.column) {
            (Some(line), Some(column)) => format!("{}:{}:{}", self.file, line, column),
            (Some(line), None) => format!("{}:{}", self.file, line),
            _ => self.file.clone(),
        }
    }
}

/// Pull the JSON payload out of `<open>\n{json}\n<close>` by substring
/// search.
pub(crate) fn extract_tagged<'a>(message: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = message.find(open)? + open.len();
    let end = message[start..].find(close)? + start;
    Some(message[start..end].trim())
}

pub(crate) fn wrap_tagged(payload: &str, open: &str, close: &str) -> String {
    format!("{open}\n{payload}\n{close}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tagged_ignores_surrounding_text() {
        let message = "Some prose\n<x>\n{\"a\":1}\n</x>\ntrailing";
        assert_eq!(extract_tagged(message, "<x>", "</x>"), Some("{\"a\":1}"));
        assert_eq!(extract_tagged("no tags here", "<x>", "</x>"), None);
        assert_eq!(extract_tagged("<x> unterminated", "<x>", "</x>"), None);
    }
}
