use chrono::Utc;
use regex::Regex;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{CompilationError, CompilationErrorKind};

lazy_static::lazy_static! {
    static ref ANSI_ESCAPE: Regex = Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap();

    // [plugin:vite:react-babel] /home/project/src/App.tsx:12:5 ...
    static ref PLUGIN_MARKER: Regex = Regex::new(r"\[plugin:[^\]]+\]").unwrap();
    static ref PLUGIN_LOCATION: Regex = Regex::new(r"(/[^\s:()]+):(\d+):(\d+)").unwrap();
    // [plugin:vite:react-babel] /home/project/src/App.tsx: Unexpected token (12:5)
    static ref PLUGIN_LOCATION_SUFFIX: Regex = Regex::new(r"(/[^\s:()]+):[^\n]*?\((\d+):(\d+)\)").unwrap();

    // src/App.tsx(12,5): error TS2304: Cannot find name 'foo'.
    static ref TYPESCRIPT_ERROR: Regex =
        Regex::new(r"(?m)^\s*([^\s(][^(\n]*?)\((\d+),(\d+)\):\s*error\s+(TS\d+):\s*(.+?)\s*$").unwrap();

    static ref IMPORT_TRIGGER: Regex =
        Regex::new(r"Failed to resolve import|Cannot find module|Module not found").unwrap();
    static ref IMPORT_MODULE: Regex = Regex::new(r#"(?:import|module)\s+["']([^"']+)["']"#).unwrap();
    static ref IMPORT_FILE: Regex = Regex::new(r#"from\s+["']([^"']+)["']"#).unwrap();
}

/// Substring → readable summary for plugin-reported syntax errors, checked
/// in order.
const SYNTAX_HINTS: &[(&str, &str)] = &[
    (
        "Unexpected token",
        "Unexpected token - check for missing or extra brackets, parentheses, or commas",
    ),
    (
        "Unexpected identifier",
        "Unexpected identifier - check for a missing comma, operator, or semicolon",
    ),
    (
        "Declaration or statement expected",
        "Declaration or statement expected - check for an unmatched closing brace",
    ),
];

fn typescript_suggestion(code: &str) -> &'static str {
    match code {
        "TS2304" => "Declare the missing name or add the import that provides it",
        "TS2307" => "Check the module path, or install the package and its type definitions",
        "TS2322" => "Make the assigned value match the declared type, or widen the type",
        "TS2339" => "Add the property to the type definition or check the property name for typos",
        "TS2345" => "Pass an argument of the parameter's declared type",
        "TS2554" => "Call the function with the number of arguments it declares",
        "TS7006" => "Add an explicit type annotation to the parameter",
        "TS1005" => "Add the missing token the compiler expects at this position",
        _ => "Review the TypeScript error and adjust the types involved",
    }
}

/// Accumulates compilation errors recognised in process output. One
/// instance per run, owned by the action runner.
pub struct ErrorMonitor {
    workdir: String,
    errors: Mutex<Vec<CompilationError>>,
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new("/home/project")
    }
}

impl ErrorMonitor {
    /// `workdir` is stripped from reported file paths so errors name files
    /// relative to the project root (`/src/App.tsx`).
    pub fn new(workdir: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into().trim_end_matches('/').to_string(),
            errors: Mutex::new(Vec::new()),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<CompilationError>> {
        self.errors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a fresh run.
    pub fn init(&self) {
        self.buffer().clear();
        info!("error monitor initialized");
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }

    pub fn errors(&self) -> Vec<CompilationError> {
        self.buffer().clone()
    }

    /// Drain the buffer in one step. Concurrent callers each get a disjoint
    /// set of errors.
    pub fn take(&self) -> Vec<CompilationError> {
        std::mem::take(&mut *self.buffer())
    }

    pub fn has_errors(&self) -> bool {
        !self.buffer().is_empty()
    }

    /// Scan `raw` for errors. Everything found is appended to the buffer;
    /// only this call's findings are returned.
    pub fn monitor_output(&self, raw: &str) -> Vec<CompilationError> {
        let text = ANSI_ESCAPE.replace_all(raw, "");

        let mut detected = Vec::new();
        detected.extend(self.detect_plugin_error(&text));
        detected.extend(self.detect_typescript_errors(&text));
        detected.extend(self.detect_import_error(&text));

        if !detected.is_empty() {
            debug!(count = detected.len(), "detected compilation errors");
            self.buffer().extend(detected.iter().cloned());
        }
        detected
    }

    fn normalize_file(&self, file: &str) -> String {
        let file = file.trim();
        match file.strip_prefix(&self.workdir) {
            Some(rest) if !self.workdir.is_empty() => {
                if rest.starts_with('/') {
                    rest.to_string()
                } else {
                    format!("/{rest}")
                }
            }
            _ => file.to_string(),
        }
    }

    fn detect_plugin_error(&self, text: &str) -> Option<CompilationError> {
        let marker = PLUGIN_MARKER.find(text)?;
        let after = &text[marker.end()..];
        let captures = PLUGIN_LOCATION
            .captures(after)
            .or_else(|| PLUGIN_LOCATION_SUFFIX.captures(after))?;

        let file = self.normalize_file(&captures[1]);
        let line: u32 = captures[2].parse().ok()?;
        let column: u32 = captures[3].parse().ok()?;

        let hinted = text.lines().find_map(|l| {
            SYNTAX_HINTS
                .iter()
                .find(|(needle, _)| l.contains(needle))
                .map(|(_, summary)| summary.to_string())
        });
        let message = hinted.unwrap_or_else(|| match source_line(text, line) {
            Some(source) => format!("Syntax error at: {source}"),
            None => format!("Syntax error in {file}"),
        });

        Some(CompilationError {
            kind: CompilationErrorKind::Syntax,
            file,
            line: Some(line),
            column: Some(column),
            message,
            raw_error: text.to_string(),
            suggestion: Some(format!(
                "Check the code around line {line} for missing or extra brackets, parentheses, or commas"
            )),
            timestamp: Utc::now(),
        })
    }

    fn detect_typescript_errors(&self, text: &str) -> Vec<CompilationError> {
        TYPESCRIPT_ERROR
            .captures_iter(text)
            .map(|captures| {
                let code = &captures[4];
                CompilationError {
                    kind: CompilationErrorKind::Typescript,
                    file: self.normalize_file(&captures[1]),
                    line: captures[2].parse().ok(),
                    column: captures[3].parse().ok(),
                    message: format!("{}: {}", code, &captures[5]),
                    raw_error: captures[0].trim().to_string(),
                    suggestion: Some(typescript_suggestion(code).to_string()),
                    timestamp: Utc::now(),
                }
            })
            .collect()
    }

    fn detect_import_error(&self, text: &str) -> Option<CompilationError> {
        if !IMPORT_TRIGGER.is_match(text) {
            return None;
        }

        let module = IMPORT_MODULE
            .captures(text)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "module".to_string());
        let file = IMPORT_FILE
            .captures(text)
            .map(|c| self.normalize_file(&c[1]))
            .unwrap_or_else(|| "unknown".to_string());

        let suggestion = if module.starts_with('.') || module.starts_with('/') {
            format!("Check that '{module}' exists at that path relative to {file}")
        } else {
            format!("Install the package with `npm install {module}` or fix the import path")
        };

        Some(CompilationError {
            kind: CompilationErrorKind::Import,
            file,
            line: None,
            column: None,
            message: format!("Cannot resolve import '{module}'"),
            raw_error: text.to_string(),
            suggestion: Some(suggestion),
            timestamp: Utc::now(),
        })
    }
}

/// Text of line `line` from a code frame such as `> 12 |   const x = ;`.
fn source_line(text: &str, line: u32) -> Option<String> {
    let prefix = line.to_string();
    text.lines().find_map(|l| {
        let trimmed = l.trim_start().trim_start_matches('>').trim_start();
        let rest = trimmed.strip_prefix(&prefix)?;
        let code = rest.trim_start().strip_prefix('|')?;
        let code = code.trim();
        (!code.is_empty()).then(|| code.to_string())
    })
}
