#![expect(
    clippy::print_stdout,
    reason = "the harness reports events and command results on stdout"
)]

use std::path::PathBuf;
use std::sync::Arc;

use agent_session::{
    ACTIVE_BACKEND_KEY, AgentHost, ApprovalDecision, ApprovalId, CapabilityOutcome,
    JsonThreadStore, MemorySettings, MemoryWorkspaces, MonitorConfig, SettingsStore, ThreadId,
    TurnContent, WorkspaceEntry, WorkspaceId, detect_installed_backends,
};
use anyhow::{Context, Result, anyhow, bail};
use app_server_client::AppServerWireLog;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(about = "Drive a coding-agent backend from stdin and print session events")]
struct Args {
    /// Workspace directory the backend runs in. Defaults to the current directory.
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Backend kind: codex, claude, gemini, cursor or custom.
    #[arg(long)]
    backend: Option<String>,
    /// Backend binary, overriding the configured one.
    #[arg(long)]
    bin: Option<String>,
    /// Extra backend arguments as one shell-style string.
    #[arg(long, allow_hyphen_values = true)]
    args: Option<String>,
    /// native, headless or auto.
    #[arg(long)]
    tier: Option<String>,
    /// Headless mode: interactive or stream-json.
    #[arg(long)]
    mode: Option<String>,
    /// Config file. Defaults to $AGENT_MONITOR_CONFIG or the user config dir.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Thread record file. Defaults to the user data dir.
    #[arg(long)]
    thread_store: Option<PathBuf>,
    /// Keep thread records in memory only.
    #[arg(long, conflicts_with = "thread_store")]
    ephemeral: bool,
    /// Append every protocol frame to this JSONL file.
    #[arg(long)]
    wire_log: Option<PathBuf>,
    /// Print installed backends and exit.
    #[arg(long)]
    detect: bool,
    /// Send this message once the thread is open.
    #[arg(long)]
    prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start,
    Resume(ThreadId),
    Threads { include_archived: bool },
    Sessions,
    Interrupt,
    Approve { id: ApprovalId, decision: ApprovalDecision },
    Models,
    Archive,
    Pin(bool),
    Revalidate,
    Help,
    Quit,
    Message(String),
}

impl Command {
    fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Message(line.to_string())));
        };
        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let command = match name {
            "start" => Self::Start,
            "resume" => {
                let thread = parts
                    .next()
                    .ok_or_else(|| anyhow!("usage: /resume <thread-id>"))?;
                Self::Resume(ThreadId::from(thread))
            }
            "threads" => Self::Threads {
                include_archived: parts.next() == Some("all"),
            },
            "sessions" => Self::Sessions,
            "interrupt" => Self::Interrupt,
            "approve" | "decline" => {
                let id = parts
                    .next()
                    .ok_or_else(|| anyhow!("usage: /{name} <request-id> [always]"))?;
                let decision = match (name, parts.next()) {
                    ("decline", _) => ApprovalDecision::Reject,
                    (_, Some(answer)) => ApprovalDecision::parse(answer)
                        .ok_or_else(|| anyhow!("unknown decision '{answer}'"))?,
                    (_, None) => ApprovalDecision::Accept,
                };
                Self::Approve {
                    id: ApprovalId::parse(id),
                    decision,
                }
            }
            "models" => Self::Models,
            "archive" => Self::Archive,
            "pin" => Self::Pin(true),
            "unpin" => Self::Pin(false),
            "revalidate" => Self::Revalidate,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '/{other}', try /help"),
        };
        Ok(Some(command))
    }
}

const HELP: &str = "commands: /start /resume <thread> /threads [all] /sessions /interrupt \
/approve <id> [always] /decline <id> /models /archive /pin /unpin /revalidate /quit; \
anything else is sent as a message";

fn print_json(value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(error) => tracing::warn!(%error, "Could not serialize output"),
    }
}

fn outcome_json<T: Serialize>(outcome: &CapabilityOutcome<T>) -> serde_json::Value {
    match outcome {
        CapabilityOutcome::Done(value) => json!({ "supported": true, "result": value }),
        CapabilityOutcome::Unsupported => json!({ "supported": false }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.detect {
        for detected in detect_installed_backends().await {
            print_json(&detected);
        }
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => {
            let mut config = MonitorConfig::from_file(path)
                .with_context(|| format!("load config {}", path.display()))?;
            config.apply_env()?;
            config
        }
        None => MonitorConfig::load()?,
    };

    let settings = Arc::new(MemorySettings::new());
    if let Some(backend) = &args.backend {
        settings.set(ACTIVE_BACKEND_KEY, backend);
    }
    let kind = args
        .backend
        .clone()
        .or_else(|| settings.get(ACTIVE_BACKEND_KEY))
        .unwrap_or_else(|| "codex".to_string());
    for (field, value) in [
        ("bin", &args.bin),
        ("args", &args.args),
        ("tier", &args.tier),
        ("mode", &args.mode),
    ] {
        if let Some(value) = value {
            settings.set(&format!("backend.{kind}.{field}"), value);
        }
    }

    let path = match args.workspace {
        Some(path) => path,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let workspace = WorkspaceId::from("default");
    let workspaces = Arc::new(MemoryWorkspaces::new());
    workspaces.insert(WorkspaceEntry {
        id: workspace.clone(),
        path,
        backend_override: None,
    });

    let mut host = AgentHost::new(config, settings, workspaces);
    let thread_store = match args.thread_store {
        Some(path) => Some(path),
        None if args.ephemeral => None,
        None => JsonThreadStore::default_path(),
    };
    if let Some(path) = thread_store {
        host = host
            .with_thread_store(Arc::new(JsonThreadStore::new(&path)))
            .with_context(|| format!("load thread records {}", path.display()))?;
    }
    if let Some(wire_log_path) = args.wire_log {
        let wire_log = AppServerWireLog::new();
        wire_log.set_path(wire_log_path);
        host = host.with_wire_log(wire_log);
    }
    let host = Arc::new(host);

    let connection = host.connect_workspace(&workspace).await?;
    print_json(&json!({ "connected": connection }));

    let mut events = host.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_json(&event);
        }
    });

    let mut current: Option<ThreadId> = None;
    if let Some(prompt) = args.prompt {
        let thread = host.start_thread(&workspace).await?;
        print_json(&json!({ "thread": thread }));
        let receipt = host
            .send_user_message(&thread.id, TurnContent::text(prompt))
            .await?;
        print_json(&json!({ "submitted": receipt }));
        current = Some(thread.id);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(error) => {
                print_json(&json!({ "error": error.to_string() }));
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(error) = run_command(&host, &workspace, &mut current, command).await {
            print_json(&json!({ "error": format!("{error:#}") }));
        }
    }

    host.shutdown().await;
    printer.abort();
    Ok(())
}

fn current_thread(current: &Option<ThreadId>) -> Result<ThreadId> {
    current
        .clone()
        .ok_or_else(|| anyhow!("no thread yet, use /start"))
}

async fn run_command(
    host: &AgentHost,
    workspace: &WorkspaceId,
    current: &mut Option<ThreadId>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Start => {
            let record = host.start_thread(workspace).await?;
            print_json(&json!({ "thread": record }));
            *current = Some(record.id);
        }
        Command::Resume(thread_id) => {
            let record = host.resume_thread(&thread_id).await?;
            print_json(&json!({ "thread": record }));
            *current = Some(thread_id);
        }
        Command::Threads { include_archived } => {
            print_json(&json!({ "threads": host.list_threads(workspace, include_archived) }));
        }
        Command::Sessions => {
            print_json(&json!({ "sessions": host.sessions().await }));
        }
        Command::Interrupt => {
            let outcome = host.interrupt_turn(&current_thread(current)?).await?;
            print_json(&json!({ "interrupt": outcome_json(&outcome) }));
        }
        Command::Approve { id, decision } => {
            let outcome = host
                .respond_to_approval(&current_thread(current)?, &id, decision)
                .await?;
            print_json(&json!({ "approval": outcome_json(&outcome) }));
        }
        Command::Models => {
            let outcome = host.list_models(&current_thread(current)?).await?;
            print_json(&json!({ "models": outcome_json(&outcome) }));
        }
        Command::Archive => {
            let record = host.archive_thread(&current_thread(current)?).await?;
            print_json(&json!({ "archived": record }));
            *current = None;
        }
        Command::Pin(pinned) => {
            let record = host.set_thread_pinned(&current_thread(current)?, pinned)?;
            print_json(&json!({ "thread": record }));
        }
        Command::Revalidate => {
            print_json(&json!({ "evicted": host.revalidate_sessions().await }));
        }
        Command::Help => print_json(&json!({ "help": HELP })),
        Command::Message(text) => {
            let receipt = host
                .send_user_message(&current_thread(current)?, TurnContent::text(text))
                .await?;
            print_json(&json!({ "submitted": receipt }));
        }
        Command::Quit => {}
    }
    Ok(())
}
