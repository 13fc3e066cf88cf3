//! Adapter binding: the resolved launch configuration of one session.
//!
//! Each field resolves through the same chain: workspace override, then the
//! settings store, then the config file, then the built-in profile for the
//! backend kind. The result is immutable for the lifetime of the session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use app_server_client::{INHERITED_ENV_VARS, ModelInfo, augmented_path, resolve_binary};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::capability::{AdapterTier, BackendKind, Capabilities, HeadlessMode, StreamDialect, TierPreference};
use crate::config::MonitorConfig;
use crate::error::BindingError;
use crate::rules::{HeadlessPatterns, HeadlessRules};
use crate::store::SettingsStore;

pub const ACTIVE_BACKEND_KEY: &str = "backend.active";
const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-workspace override, every field optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BindingOverride {
    pub backend: Option<String>,
    pub bin: Option<String>,
    pub args: Option<String>,
    pub home: Option<PathBuf>,
    pub tier: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdapterBinding {
    pub kind: BackendKind,
    pub tier: AdapterTier,
    pub program: String,
    /// Full argument list, tier-specific arguments included.
    pub args: Vec<String>,
    pub home: Option<(String, PathBuf)>,
    pub env: Vec<(String, String)>,
    /// Host variables passed through beyond the fixed allowlist.
    pub inherit_env: Vec<String>,
    pub capabilities: Capabilities,
    /// Only consulted on the headless tier.
    pub headless_mode: HeadlessMode,
    pub headless_rules: HeadlessRules,
    /// Static model catalog for backends that cannot list models themselves.
    pub models: Vec<ModelInfo>,
}

/// Everything but the tier, which may need a trial launch to decide.
#[derive(Debug, Clone)]
pub struct BindingPlan {
    pub kind: BackendKind,
    pub tier: TierPreference,
    pub program: String,
    pub user_args: Vec<String>,
    pub home: Option<(String, PathBuf)>,
    pub env: Vec<(String, String)>,
    pub inherit_env: Vec<String>,
    pub headless_mode: HeadlessMode,
    pub headless_rules: HeadlessRules,
    profile: BackendProfile,
}

#[derive(Debug, Clone, Copy)]
struct BackendProfile {
    bin: &'static str,
    home_var: Option<&'static str>,
    /// Arguments that select the app-server mode, when the CLI has one.
    native_args: Option<&'static [&'static str]>,
    tier: TierPreference,
    headless_mode: HeadlessMode,
    models: &'static [(&'static str, &'static str)],
}

fn builtin_profile(kind: BackendKind) -> BackendProfile {
    match kind {
        BackendKind::Codex => BackendProfile {
            bin: "codex",
            home_var: Some("CODEX_HOME"),
            native_args: Some(&["app-server"]),
            tier: TierPreference::Auto,
            headless_mode: HeadlessMode::Interactive,
            models: &[],
        },
        BackendKind::Claude => BackendProfile {
            bin: "claude",
            home_var: Some("CLAUDE_HOME"),
            native_args: None,
            tier: TierPreference::Headless,
            headless_mode: HeadlessMode::StreamJson(StreamDialect::Claude),
            models: &[
                ("claude-sonnet-4-20250514", "Claude Sonnet 4"),
                ("claude-opus-4-20250514", "Claude Opus 4"),
                ("claude-haiku-4-20250514", "Claude Haiku 4"),
            ],
        },
        BackendKind::Gemini => BackendProfile {
            bin: "gemini",
            home_var: Some("GEMINI_HOME"),
            native_args: None,
            tier: TierPreference::Headless,
            headless_mode: HeadlessMode::StreamJson(StreamDialect::Gemini),
            models: &[
                ("gemini-2.5-flash", "Gemini 2.5 Flash"),
                ("gemini-2.5-pro", "Gemini 2.5 Pro"),
            ],
        },
        BackendKind::Cursor => BackendProfile {
            bin: "cursor-agent",
            home_var: None,
            native_args: None,
            tier: TierPreference::Headless,
            headless_mode: HeadlessMode::StreamJson(StreamDialect::Cursor),
            models: &[],
        },
        BackendKind::Custom => BackendProfile {
            bin: "",
            home_var: None,
            native_args: Some(&[]),
            tier: TierPreference::Native,
            headless_mode: HeadlessMode::Interactive,
            models: &[],
        },
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn setting(settings: &dyn SettingsStore, kind: BackendKind, field: &str) -> Option<String> {
    non_empty(settings.get(&format!("backend.{kind}.{field}")))
}

/// Resolve every binding field except the final tier.
pub fn plan_binding(
    workspace: Option<&BindingOverride>,
    settings: &dyn SettingsStore,
    config: &MonitorConfig,
) -> Result<BindingPlan, BindingError> {
    let empty = BindingOverride::default();
    let workspace = workspace.unwrap_or(&empty);

    let kind_name = non_empty(workspace.backend.clone())
        .or_else(|| non_empty(settings.get(ACTIVE_BACKEND_KEY)))
        .unwrap_or_else(|| BackendKind::Codex.as_str().to_string());
    let kind = BackendKind::parse(&kind_name)
        .ok_or_else(|| BindingError::UnknownBackend(kind_name.clone()))?;
    let profile = builtin_profile(kind);
    let file = config.backend(kind.as_str()).cloned().unwrap_or_default();

    let program = non_empty(workspace.bin.clone())
        .or_else(|| setting(settings, kind, "bin"))
        .or_else(|| non_empty(file.bin.clone()))
        .or_else(|| Some(profile.bin.to_string()).filter(|bin| !bin.is_empty()))
        .ok_or(BindingError::MissingBinary)?;

    let args = non_empty(workspace.args.clone())
        .or_else(|| setting(settings, kind, "args"))
        .or_else(|| non_empty(file.args.clone()));
    let user_args = match args {
        Some(args) => shell_words::split(&args).map_err(|source| BindingError::InvalidArgs {
            kind: kind.to_string(),
            source,
        })?,
        None => Vec::new(),
    };

    let home_path = workspace
        .home
        .clone()
        .or_else(|| setting(settings, kind, "home").map(PathBuf::from))
        .or_else(|| file.home.clone());
    let home = match (home_path, profile.home_var) {
        (Some(path), Some(var)) => Some((var.to_string(), path)),
        (Some(path), None) => {
            tracing::warn!(backend = %kind, path = %path.display(), "Backend has no home variable; ignoring home override");
            None
        }
        (None, _) => None,
    };

    let tier_name = non_empty(workspace.tier.clone())
        .or_else(|| setting(settings, kind, "tier"))
        .or_else(|| non_empty(file.tier.clone()));
    let tier = match tier_name {
        Some(value) => TierPreference::parse(&value).ok_or_else(|| BindingError::InvalidTier {
            kind: kind.to_string(),
            value,
        })?,
        None => profile.tier,
    };

    let mode_name = non_empty(workspace.mode.clone())
        .or_else(|| setting(settings, kind, "mode"))
        .or_else(|| non_empty(file.mode.clone()));
    let headless_mode = match mode_name {
        Some(value) => HeadlessMode::parse(&value, kind).ok_or_else(|| BindingError::InvalidMode {
            kind: kind.to_string(),
            value,
        })?,
        None => profile.headless_mode,
    };

    let patterns = HeadlessPatterns::for_backend(kind).with_overrides(&file.headless);
    let headless_rules = HeadlessRules::compile(&patterns)?;

    let env: BTreeMap<String, String> = file.env.clone().into_iter().collect();

    Ok(BindingPlan {
        kind,
        tier,
        program,
        user_args,
        home,
        env: env.into_iter().collect(),
        inherit_env: file.inherit_env.clone(),
        headless_mode,
        headless_rules,
        profile,
    })
}

impl BindingPlan {
    /// Decide the tier (a trial `--help` run when `auto`) and produce the
    /// final binding.
    pub async fn finalize(self, cwd: &Path) -> AdapterBinding {
        let tier = match (self.tier, self.profile.native_args) {
            (TierPreference::Native, Some(_)) => AdapterTier::Native,
            (TierPreference::Native, None) => {
                tracing::warn!(backend = %self.kind, "Backend has no app-server mode; using headless tier");
                AdapterTier::Headless
            }
            (TierPreference::Headless, _) | (TierPreference::Auto, None) => AdapterTier::Headless,
            (TierPreference::Auto, Some(native_args)) => {
                let mut check_args = self.user_args.clone();
                check_args.extend(native_args.iter().map(|arg| arg.to_string()));
                check_args.push("--help".to_string());
                if app_server_available(&self.program, &check_args, cwd, self.home.as_ref()).await {
                    AdapterTier::Native
                } else {
                    tracing::info!(backend = %self.kind, program = %self.program, "App-server check failed; using headless tier");
                    AdapterTier::Headless
                }
            }
        };
        self.into_binding(tier)
    }

    /// Produce the binding for an already-decided tier.
    #[must_use]
    pub fn into_binding(self, tier: AdapterTier) -> AdapterBinding {
        let mut args = self.user_args;
        if tier == AdapterTier::Native
            && let Some(native_args) = self.profile.native_args
        {
            args.extend(native_args.iter().map(|arg| arg.to_string()));
        }

        let mut capabilities = match (tier, self.headless_mode) {
            (AdapterTier::Headless, HeadlessMode::StreamJson(_)) => Capabilities::for_stream_json(),
            _ => Capabilities::for_tier(tier),
        };
        if tier == AdapterTier::Headless {
            capabilities.model_list = !self.profile.models.is_empty();
        }

        let models = self
            .profile
            .models
            .iter()
            .enumerate()
            .map(|(index, (id, name))| ModelInfo {
                id: (*id).to_string(),
                model: (*id).to_string(),
                display_name: (*name).to_string(),
                description: String::new(),
                default_reasoning_effort: None,
                is_default: index == 0,
            })
            .collect();

        AdapterBinding {
            kind: self.kind,
            tier,
            program: self.program,
            args,
            home: self.home,
            env: self.env,
            inherit_env: self.inherit_env,
            capabilities,
            headless_mode: self.headless_mode,
            headless_rules: self.headless_rules,
            models,
        }
    }
}

/// Resolve and finalize in one step.
pub async fn resolve_binding(
    workspace: Option<&BindingOverride>,
    settings: &dyn SettingsStore,
    config: &MonitorConfig,
    cwd: &Path,
) -> Result<AdapterBinding, BindingError> {
    Ok(plan_binding(workspace, settings, config)?.finalize(cwd).await)
}

fn detect_command(program: &str, args: &[String], home: Option<&(String, PathBuf)>) -> Option<Command> {
    let resolved = resolve_binary(program, None)?;
    let mut command = Command::new(&resolved);
    command.args(args);
    command.env_clear();
    for name in INHERITED_ENV_VARS {
        if let Some(value) = std::env::var_os(name) {
            command.env(name, value);
        }
    }
    if let Some(path) = augmented_path(&resolved, None) {
        command.env("PATH", path);
    }
    if let Some((var, path)) = home {
        command.env(var, path);
    }
    command.stdin(Stdio::null());
    command.kill_on_drop(true);
    Some(command)
}

async fn app_server_available(
    program: &str,
    args: &[String],
    cwd: &Path,
    home: Option<&(String, PathBuf)>,
) -> bool {
    let Some(mut command) = detect_command(program, args, home) else {
        return false;
    };
    if cwd.is_dir() {
        command.current_dir(cwd);
    }
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());
    match tokio::time::timeout(DETECT_TIMEOUT, command.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(err)) => {
            tracing::debug!(program, error = %err, "App-server check failed to start");
            false
        }
        Err(_) => {
            tracing::debug!(program, "App-server check timed out");
            false
        }
    }
}

/// Installed version of one built-in backend, if its binary answered
/// `--version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedBackend {
    pub kind: BackendKind,
    pub version: Option<String>,
}

/// Ask each built-in backend's default binary for its version concurrently.
/// Configured binary overrides are not consulted.
pub async fn detect_installed_backends() -> Vec<DetectedBackend> {
    let checks = BackendKind::BUILT_IN.into_iter().map(|kind| async move {
        DetectedBackend {
            kind,
            version: installed_version(builtin_profile(kind).bin).await,
        }
    });
    futures::future::join_all(checks).await
}

async fn installed_version(program: &str) -> Option<String> {
    let mut command = detect_command(program, &["--version".to_string()], None)?;
    command.stdout(Stdio::piped());
    command.stderr(Stdio::null());
    let output = match tokio::time::timeout(DETECT_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(program, error = %err, "Version check failed to start");
            return None;
        }
        Err(_) => {
            tracing::debug!(program, "Version check timed out");
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!version.is_empty()).then_some(version)
}
