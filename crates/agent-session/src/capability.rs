//! Backend kinds, adapter tiers and the capability sets they declare.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Codex,
    Claude,
    Gemini,
    Cursor,
    Custom,
}

impl BackendKind {
    pub const BUILT_IN: [Self; 4] = [Self::Codex, Self::Claude, Self::Gemini, Self::Cursor];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Cursor => "cursor",
            Self::Custom => "custom",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "codex" => Some(Self::Codex),
            "claude" | "claude-code" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "cursor" | "cursor-agent" => Some(Self::Cursor),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which adapter implementation drives a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterTier {
    /// Speaks the app-server JSON-RPC protocol.
    Native,
    /// Interactive text CLI driven through stdin/stdout pattern matching.
    Headless,
}

impl AdapterTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Headless => "headless",
        }
    }
}

/// Configured tier. `Auto` checks for an app-server mode before the session
/// starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierPreference {
    Native,
    Headless,
    #[default]
    Auto,
}

impl TierPreference {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" => Some(Self::Native),
            "headless" => Some(Self::Headless),
            "auto" | "" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// How a headless backend is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "mode", content = "dialect", rename_all = "kebab-case")]
pub enum HeadlessMode {
    /// One long-lived interactive process, output matched with patterns.
    #[default]
    Interactive,
    /// One `--output-format stream-json` process per turn.
    StreamJson(StreamDialect),
}

impl HeadlessMode {
    /// Parse a configured mode. Stream-json uses the dialect of `kind`.
    #[must_use]
    pub fn parse(value: &str, kind: BackendKind) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interactive" => Some(Self::Interactive),
            "stream-json" | "stream_json" | "streamjson" => {
                Some(Self::StreamJson(StreamDialect::for_backend(kind)))
            }
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::StreamJson(_) => "stream-json",
        }
    }
}

/// Event vocabulary of a stream-json CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDialect {
    Claude,
    Gemini,
    Cursor,
}

impl StreamDialect {
    /// Kinds without a dialect of their own speak Claude's.
    #[must_use]
    pub const fn for_backend(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Gemini => Self::Gemini,
            BackendKind::Cursor => Self::Cursor,
            BackendKind::Claude | BackendKind::Codex | BackendKind::Custom => Self::Claude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub structured_rpc: bool,
    pub interrupt: bool,
    pub approvals: bool,
    pub collaboration_modes: bool,
    pub model_list: bool,
    pub thread_list: bool,
}

impl Capabilities {
    #[must_use]
    pub const fn for_tier(tier: AdapterTier) -> Self {
        match tier {
            AdapterTier::Native => Self {
                structured_rpc: true,
                interrupt: true,
                approvals: true,
                collaboration_modes: true,
                model_list: true,
                thread_list: true,
            },
            AdapterTier::Headless => Self {
                structured_rpc: false,
                interrupt: cfg!(unix),
                approvals: true,
                collaboration_modes: false,
                model_list: true,
                thread_list: false,
            },
        }
    }
}

impl Capabilities {
    /// Per-turn processes: interrupt is a kill and nothing waits on stdin.
    #[must_use]
    pub const fn for_stream_json() -> Self {
        Self {
            structured_rpc: false,
            interrupt: true,
            approvals: false,
            collaboration_modes: false,
            model_list: true,
            thread_list: false,
        }
    }
}

/// Result of invoking an operation a backend may not support. Unsupported is
/// a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityOutcome<T> {
    Done(T),
    Unsupported,
}

impl<T> CapabilityOutcome<T> {
    #[must_use]
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CapabilityOutcome<U> {
        match self {
            Self::Done(value) => CapabilityOutcome::Done(f(value)),
            Self::Unsupported => CapabilityOutcome::Unsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parse_accepts_aliases() {
        assert_eq!(BackendKind::parse("Claude-Code"), Some(BackendKind::Claude));
        assert_eq!(BackendKind::parse("cursor-agent"), Some(BackendKind::Cursor));
        assert_eq!(BackendKind::parse("vim"), None);
        for kind in BackendKind::BUILT_IN {
            assert_eq!(BackendKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn headless_tier_has_no_structured_rpc() {
        let caps = Capabilities::for_tier(AdapterTier::Headless);
        assert!(!caps.structured_rpc);
        assert!(!caps.collaboration_modes);
        assert!(Capabilities::for_tier(AdapterTier::Native).structured_rpc);
    }

    #[test]
    fn stream_json_mode_takes_the_backend_dialect() {
        assert_eq!(
            HeadlessMode::parse("stream-json", BackendKind::Gemini),
            Some(HeadlessMode::StreamJson(StreamDialect::Gemini))
        );
        assert_eq!(
            HeadlessMode::parse("Stream_JSON", BackendKind::Custom),
            Some(HeadlessMode::StreamJson(StreamDialect::Claude))
        );
        assert_eq!(
            HeadlessMode::parse("interactive", BackendKind::Claude),
            Some(HeadlessMode::Interactive)
        );
        assert_eq!(HeadlessMode::parse("pty", BackendKind::Claude), None);
        assert!(!Capabilities::for_stream_json().approvals);
    }
}
