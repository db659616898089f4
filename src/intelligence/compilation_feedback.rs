use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use super::{extract_tagged, wrap_tagged, CompilationError, CompilationErrorKind};

pub const COMPILATION_ERRORS_OPEN: &str = "<compilation_errors>";
pub const COMPILATION_ERRORS_CLOSE: &str = "</compilation_errors>";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompilationSeverity {
    Warning,
    Error,
    Critical,
}

fn fix_instructions(kind: CompilationErrorKind) -> &'static [&'static str] {
    match kind {
        CompilationErrorKind::Syntax => &[
            "Open the file at the reported line and column",
            "Balance every bracket, brace, and parenthesis",
            "Add missing commas, semicolons, or operators",
            "Close any unterminated string or JSX tag",
        ],
        CompilationErrorKind::Import => &[
            "Check that the import path matches an existing file (including extension and case)",
            "If it is a package, add it to package.json and run npm install",
            "Use the correct named or default import form for the module",
        ],
        CompilationErrorKind::Typescript => &[
            "Read the TS error code and fix the type mismatch it describes",
            "Declare or import every identifier that is referenced",
            "Update interfaces and prop types so the values match",
            "Do not silence the error with `any` or `@ts-ignore`",
        ],
        CompilationErrorKind::Runtime => &[
            "Guard against undefined or null values before accessing properties",
            "Check that functions are called with the expected arguments",
        ],
        CompilationErrorKind::Build => &[
            "Fix the build configuration or script that failed",
            "Make sure every required dependency is installed",
            "Re-run the build after applying the fixes",
        ],
    }
}

/// Formatting for compilation errors: UI markdown, LLM prompt and the
/// tagged message payload.
pub struct CompilationFeedback;

impl CompilationFeedback {
    pub fn severity(errors: &[CompilationError]) -> CompilationSeverity {
        if errors
            .iter()
            .any(|e| matches!(e.kind, CompilationErrorKind::Build | CompilationErrorKind::Syntax))
        {
            CompilationSeverity::Critical
        } else if errors.len() > 3 {
            CompilationSeverity::Error
        } else {
            CompilationSeverity::Warning
        }
    }

    pub fn summary(errors: &[CompilationError]) -> String {
        let files: std::collections::BTreeSet<&str> = errors.iter().map(|e| e.file.as_str()).collect();
        let plural = |n: usize, word: &str| if n == 1 { format!("{n} {word}") } else { format!("{n} {word}s") };
        format!(
            "{} in {}",
            plural(errors.len(), "compilation error"),
            plural(files.len(), "file")
        )
    }

    /// Markdown for the UI, grouped by file.
    pub fn format_markdown(errors: &[CompilationError]) -> String {
        if errors.is_empty() {
            return "✅ No compilation errors detected.".to_string();
        }

        let mut by_file: BTreeMap<&str, Vec<&CompilationError>> = BTreeMap::new();
        for error in errors {
            by_file.entry(error.file.as_str()).or_default().push(error);
        }

        let mut output = format!("## ❌ Compilation Errors ({})\n\n", errors.len());
        for (file, file_errors) in by_file {
            output.push_str(&format!("### `{file}`\n\n"));
            for error in file_errors {
                let position = match (error.line, error.column) {
                    (Some(line), Some(column)) => format!("Line {line}:{column}"),
                    (Some(line), None) => format!("Line {line}"),
                    _ => "Unknown position".to_string(),
                };
                output.push_str(&format!(
                    "- **{}** ({}): {}\n",
                    position,
                    error.kind.label().to_lowercase(),
                    error.message
                ));
                if let Some(suggestion) = &error.suggestion {
                    output.push_str(&format!("  - 💡 {suggestion}\n"));
                }
            }
            output.push('\n');
        }
        output
    }

    /// Prompt asking the model to fix every listed error.
    pub fn format_for_llm(errors: &[CompilationError]) -> String {
        let mut prompt = String::from(
            "The project failed to compile. Fix ALL of the following errors before doing anything else.\n\n",
        );

        for (index, error) in errors.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. [{}] {}\n   Error: {}\n",
                index + 1,
                error.kind.label(),
                error.location(),
                error.message
            ));
            if let Some(suggestion) = &error.suggestion {
                prompt.push_str(&format!("   Hint: {suggestion}\n"));
            }
            prompt.push_str("   How to fix:\n");
            for instruction in fix_instructions(error.kind) {
                prompt.push_str(&format!("   - {instruction}\n"));
            }
            prompt.push('\n');
        }

        prompt.push_str(
            "Rewrite each affected file in full with the fixes applied, then restart the dev server.",
        );
        prompt
    }

    pub fn format_for_message(errors: &[CompilationError]) -> String {
        let payload = serde_json::to_string_pretty(errors).unwrap_or_else(|_| "[]".to_string());
        wrap_tagged(&payload, COMPILATION_ERRORS_OPEN, COMPILATION_ERRORS_CLOSE)
    }

    /// Recover errors embedded by [`Self::format_for_message`].
    pub fn parse_compilation_errors(message: &str) -> Option<Vec<CompilationError>> {
        let payload = extract_tagged(message, COMPILATION_ERRORS_OPEN, COMPILATION_ERRORS_CLOSE)?;
        match serde_json::from_str(payload) {
            Ok(errors) => Some(errors),
            Err(e) => {
                warn!("invalid compilation error payload: {}", e);
                None
            }
        }
    }
}
