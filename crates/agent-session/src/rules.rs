//! Line classification rules for text-stream (headless) backends.
//!
//! Interactive CLIs print human-readable text, so recognizing tool calls,
//! approval prompts and the end of a turn is pattern matching on that text.
//! The patterns are data: every backend kind has a default set and each field
//! can be overridden from configuration when a CLI changes its output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::capability::BackendKind;
use crate::error::BindingError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadlessPatterns {
    /// Marks the backend as idle again (prompt redisplayed).
    pub turn_completed: String,
    /// A tool or command started. Optional `tool` capture group.
    pub tool_started: String,
    /// The backend waits for a yes/no answer. Optional `command` group.
    pub approval_request: String,
    /// A turn-level error. Optional `message` group.
    pub error: String,
    /// Lines dropped entirely (spinners, blank frames).
    pub ignore: Vec<String>,
    pub approve_reply: String,
    pub approve_for_session_reply: String,
    pub reject_reply: String,
}

impl HeadlessPatterns {
    #[must_use]
    pub fn for_backend(kind: BackendKind) -> Self {
        let mut patterns = Self {
            turn_completed: r"^\s*(?:>|❯)\s*$|^\[turn complete\]$".to_string(),
            tool_started: r"^(?:⏺|●|•|\*)?\s*(?:Running|Executing|Tool call|Calling tool)[:\s]+(?P<tool>.+?)\s*$".to_string(),
            approval_request: r"(?i)^.*?(?:awaiting approval|allow command|do you want to run)[:\s]+(?P<command>.+?)\s*(?:\?\s*)?(?:\[y/n\].*)?$".to_string(),
            error: r"(?i)^\s*(?:error|fatal)[:\s]+(?P<message>.+)$".to_string(),
            ignore: vec![r"^[\s⠁-⣿]*$".to_string()],
            approve_reply: "y".to_string(),
            approve_for_session_reply: "a".to_string(),
            reject_reply: "n".to_string(),
        };
        match kind {
            BackendKind::Claude => {
                patterns.tool_started = r"^(?:⏺|●)\s*(?P<tool>(?:Bash|Read|Edit|Write|Grep|Glob|WebFetch|Task)\(.*\))\s*$|^(?:Running|Tool call)[:\s]+(?P<other>.+)$".to_string();
            }
            BackendKind::Gemini => {
                patterns.tool_started = r"^(?:✦|✔|⊶)?\s*(?:Running|Executing|Shell)[:\s]+(?P<tool>.+?)\s*$".to_string();
                patterns.approval_request = r"(?i)^.*?(?:allow execution|awaiting approval|apply this change)[:\s]+(?P<command>.+?)\s*(?:\?\s*)?(?:\[y/n\].*)?$".to_string();
            }
            BackendKind::Cursor => {
                patterns.approval_request = r"(?i)^.*?(?:run this command|awaiting approval)[:\s]+(?P<command>.+?)\s*(?:\?\s*)?(?:\[y/n\].*)?$".to_string();
            }
            BackendKind::Codex | BackendKind::Custom => {}
        }
        patterns
    }

    /// Apply non-empty overrides on top of these patterns.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &HeadlessRuleOverrides) -> Self {
        let replace = |target: &mut String, value: &Option<String>| {
            if let Some(value) = value.as_ref().filter(|value| !value.trim().is_empty()) {
                target.clone_from(value);
            }
        };
        replace(&mut self.turn_completed, &overrides.turn_completed);
        replace(&mut self.tool_started, &overrides.tool_started);
        replace(&mut self.approval_request, &overrides.approval_request);
        replace(&mut self.error, &overrides.error);
        replace(&mut self.approve_reply, &overrides.approve_reply);
        replace(
            &mut self.approve_for_session_reply,
            &overrides.approve_for_session_reply,
        );
        replace(&mut self.reject_reply, &overrides.reject_reply);
        if let Some(ignore) = &overrides.ignore {
            self.ignore.clone_from(ignore);
        }
        self
    }
}

/// Per-field overrides as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessRuleOverrides {
    pub turn_completed: Option<String>,
    pub tool_started: Option<String>,
    pub approval_request: Option<String>,
    pub error: Option<String>,
    pub ignore: Option<Vec<String>>,
    pub approve_reply: Option<String>,
    pub approve_for_session_reply: Option<String>,
    pub reject_reply: Option<String>,
}

/// What one output line means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    TurnCompleted,
    ToolStarted { tool: String },
    ApprovalRequest { command: String },
    Error { message: String },
    Ignored,
    /// Anything unrecognized is assistant text.
    Text(String),
}

#[derive(Debug, Clone)]
pub struct HeadlessRules {
    turn_completed: Regex,
    tool_started: Regex,
    approval_request: Regex,
    error: Regex,
    ignore: Vec<Regex>,
    pub approve_reply: String,
    pub approve_for_session_reply: String,
    pub reject_reply: String,
}

static ANSI_ESCAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").ok());

impl HeadlessRules {
    pub fn compile(patterns: &HeadlessPatterns) -> Result<Self, BindingError> {
        Ok(Self {
            turn_completed: compile(&patterns.turn_completed)?,
            tool_started: compile(&patterns.tool_started)?,
            approval_request: compile(&patterns.approval_request)?,
            error: compile(&patterns.error)?,
            ignore: patterns
                .ignore
                .iter()
                .map(|pattern| compile(pattern))
                .collect::<Result<_, _>>()?,
            approve_reply: patterns.approve_reply.clone(),
            approve_for_session_reply: patterns.approve_for_session_reply.clone(),
            reject_reply: patterns.reject_reply.clone(),
        })
    }

    /// Classify one line. Checks run in a fixed order: ignore, turn end,
    /// approval, tool, error, then the text fallback.
    #[must_use]
    pub fn classify(&self, raw: &str) -> LineClass {
        let stripped = strip_ansi(raw);
        let line = stripped.trim_end_matches(['\r', '\n']);

        if self.ignore.iter().any(|pattern| pattern.is_match(line)) {
            return LineClass::Ignored;
        }
        if self.turn_completed.is_match(line) {
            return LineClass::TurnCompleted;
        }
        if let Some(command) = capture(&self.approval_request, line, &["command"]) {
            return LineClass::ApprovalRequest { command };
        }
        if let Some(tool) = capture(&self.tool_started, line, &["tool", "other"]) {
            return LineClass::ToolStarted { tool };
        }
        if let Some(message) = capture(&self.error, line, &["message"]) {
            return LineClass::Error { message };
        }
        LineClass::Text(line.to_string())
    }
}

fn compile(pattern: &str) -> Result<Regex, BindingError> {
    Regex::new(pattern).map_err(|source| BindingError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Text of the first named group that matched, else group 1, else the whole
/// match.
fn capture(pattern: &Regex, line: &str, names: &[&str]) -> Option<String> {
    let captures = pattern.captures(line)?;
    let text = names
        .iter()
        .find_map(|name| captures.name(name))
        .or_else(|| captures.get(1))
        .or_else(|| captures.get(0))
        .map_or("", |found| found.as_str());
    Some(text.trim().to_string())
}

fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    match ANSI_ESCAPE.as_ref() {
        Some(pattern) => pattern.replace_all(line, ""),
        None => std::borrow::Cow::Borrowed(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(kind: BackendKind) -> Result<HeadlessRules, BindingError> {
        HeadlessRules::compile(&HeadlessPatterns::for_backend(kind))
    }

    #[test]
    fn default_rules_compile_for_every_backend() -> Result<(), BindingError> {
        for kind in BackendKind::BUILT_IN {
            rules(kind)?;
        }
        rules(BackendKind::Custom)?;
        Ok(())
    }

    #[test]
    fn approval_prompt_captures_command() -> Result<(), BindingError> {
        let rules = rules(BackendKind::Custom)?;
        assert_eq!(
            rules.classify("Awaiting approval: rm -rf build [y/n]"),
            LineClass::ApprovalRequest {
                command: "rm -rf build".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn prompt_line_ends_the_turn() -> Result<(), BindingError> {
        let rules = rules(BackendKind::Claude)?;
        assert_eq!(rules.classify("> "), LineClass::TurnCompleted);
        assert_eq!(rules.classify("\x1b[1m❯\x1b[0m"), LineClass::TurnCompleted);
        Ok(())
    }

    #[test]
    fn tool_and_error_lines_are_recognized() -> Result<(), BindingError> {
        let rules = rules(BackendKind::Claude)?;
        assert_eq!(
            rules.classify("⏺ Bash(cargo fmt)"),
            LineClass::ToolStarted {
                tool: "Bash(cargo fmt)".to_string()
            }
        );
        assert_eq!(
            rules.classify("Error: quota exceeded"),
            LineClass::Error {
                message: "quota exceeded".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn unrecognized_lines_become_text() -> Result<(), BindingError> {
        let rules = rules(BackendKind::Gemini)?;
        assert_eq!(
            rules.classify("Here is the refactored function."),
            LineClass::Text("Here is the refactored function.".to_string())
        );
        assert_eq!(rules.classify("   "), LineClass::Ignored);
        Ok(())
    }

    #[test]
    fn overrides_replace_only_given_fields() -> Result<(), BindingError> {
        let patterns = HeadlessPatterns::for_backend(BackendKind::Custom).with_overrides(
            &HeadlessRuleOverrides {
                turn_completed: Some("^DONE$".to_string()),
                reject_reply: Some("no".to_string()),
                ..HeadlessRuleOverrides::default()
            },
        );
        assert_eq!(patterns.turn_completed, "^DONE$");
        assert_eq!(patterns.reject_reply, "no");
        assert_eq!(patterns.approve_reply, "y");

        let compiled = HeadlessRules::compile(&patterns)?;
        assert_eq!(compiled.classify("DONE"), LineClass::TurnCompleted);
        assert!(matches!(compiled.classify("> "), LineClass::Text(_)));
        Ok(())
    }

    #[test]
    fn invalid_patterns_are_reported() {
        let mut patterns = HeadlessPatterns::for_backend(BackendKind::Custom);
        patterns.error = "(".to_string();
        assert!(matches!(
            HeadlessRules::compile(&patterns),
            Err(BindingError::InvalidPattern { .. })
        ));
    }
}
