//! Adapter for interactive text CLIs.
//!
//! Prompts are written to stdin one line at a time. Output lines from stdout
//! and stderr are classified with the binding's [`HeadlessRules`] and turned
//! into the same events the native adapter produces. Classification is best
//! effort: anything unrecognized is surfaced as assistant text.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use app_server_client::{
    ExitReason, ModelInfo, ProcessConfig, ProcessHandle, RequestId, ThreadSummary,
    read_line_lossy,
};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};

use super::{
    AdapterEvent, ApprovalDecision, ApprovalKind, BackendAdapter, BackendTurnOutcome,
    LaunchOptions, ModelCatalog, PendingApproval, ProgressKind, TurnContent, TurnDispatch,
    TurnProgress,
};
use crate::binding::AdapterBinding;
use crate::capability::{AdapterTier, Capabilities, CapabilityOutcome};
use crate::error::{AdapterError, SessionError};
use crate::ids::ApprovalId;
use crate::rules::{HeadlessRules, LineClass};

/// Upper bound on waiting for the prompt to come back after an interrupt.
const INTERRUPT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct LineState {
    current_turn: Option<String>,
    pending_approval: Option<ApprovalId>,
}

pub struct HeadlessAdapter {
    process: Arc<ProcessHandle>,
    rules: Arc<HeadlessRules>,
    capabilities: Capabilities,
    models: Vec<ModelInfo>,
    state: Arc<Mutex<LineState>>,
    /// True from an interrupt until the backend prints its prompt again.
    discarding: watch::Sender<bool>,
    next_turn: AtomicU64,
}

impl HeadlessAdapter {
    pub fn launch(
        binding: &AdapterBinding,
        options: &LaunchOptions,
        events: mpsc::Sender<AdapterEvent>,
    ) -> Result<Self, SessionError> {
        let (process, output) = ProcessHandle::spawn(ProcessConfig {
            program: binding.program.clone(),
            args: binding.args.clone(),
            cwd: options.cwd.clone(),
            env: binding.env.clone(),
            home: binding.home.clone(),
            inherit_env: binding.inherit_env.clone(),
        })?;
        let process = Arc::new(process);
        let rules = Arc::new(binding.headless_rules.clone());
        let state = Arc::new(Mutex::new(LineState::default()));
        let (discarding, _) = watch::channel(false);

        let classifier = LineClassifier {
            rules: rules.clone(),
            state: state.clone(),
            discarding: discarding.clone(),
            events,
            next_approval: 0,
        };
        tokio::spawn(read_lines(
            classifier,
            Box::new(output.stdout),
            Box::new(output.stderr),
            process.clone(),
            options.grace,
        ));

        Ok(Self {
            process,
            rules,
            capabilities: binding.capabilities,
            models: binding.models.clone(),
            state,
            discarding,
            next_turn: AtomicU64::new(1),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BackendAdapter for HeadlessAdapter {
    fn tier(&self) -> AdapterTier {
        AdapterTier::Headless
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    async fn start_thread(&self, _cwd: &Path) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }

    async fn resume_thread(
        &self,
        _backend_thread_id: &str,
        _cwd: &Path,
    ) -> Result<CapabilityOutcome<String>, AdapterError> {
        Ok(CapabilityOutcome::Unsupported)
    }

    async fn list_threads(
        &self,
        _cwd: &Path,
    ) -> Result<CapabilityOutcome<Vec<ThreadSummary>>, AdapterError> {
        Ok(CapabilityOutcome::Unsupported)
    }

    async fn start_turn(
        &self,
        _backend_thread_id: &str,
        content: &TurnContent,
    ) -> Result<TurnDispatch, AdapterError> {
        let backend_turn_id = format!(
            "headless-turn-{}",
            self.next_turn.fetch_add(1, Ordering::Relaxed)
        );
        self.lock_state().current_turn = Some(backend_turn_id.clone());

        // Interactive prompts submit on newline, so the message goes as one line.
        let mut line = content.text.replace(['\r', '\n'], " ");
        line.push('\n');
        if let Err(err) = self.process.write(line.as_bytes()).await {
            self.lock_state().current_turn = None;
            return Err(err.into());
        }
        Ok(TurnDispatch::Started { backend_turn_id })
    }

    async fn interrupt_turn(
        &self,
        _backend_thread_id: &str,
        backend_turn_id: &str,
    ) -> Result<CapabilityOutcome<()>, AdapterError> {
        if !self.capabilities.interrupt {
            return Ok(CapabilityOutcome::Unsupported);
        }
        {
            let mut state = self.lock_state();
            if state.current_turn.as_deref() != Some(backend_turn_id) {
                return Ok(CapabilityOutcome::Done(()));
            }
            state.current_turn = None;
            state.pending_approval = None;
        }
        let mut settled = self.discarding.subscribe();
        self.discarding.send_replace(true);
        if !self.process.signal_interrupt() {
            self.discarding.send_replace(false);
            return Ok(CapabilityOutcome::Done(()));
        }
        if tokio::time::timeout(INTERRUPT_SETTLE_TIMEOUT, settled.wait_for(|discarding| !discarding))
            .await
            .is_err()
        {
            tracing::warn!(program = %self.process.program(), "Backend did not return to its prompt after interrupt");
            self.discarding.send_replace(false);
        }
        Ok(CapabilityOutcome::Done(()))
    }

    async fn respond_to_approval(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<CapabilityOutcome<()>, AdapterError> {
        if !self.capabilities.approvals {
            return Ok(CapabilityOutcome::Unsupported);
        }
        {
            let mut state = self.lock_state();
            if state.pending_approval.as_ref() != Some(id) {
                tracing::debug!(%id, "Approval is no longer pending at the prompt");
                return Ok(CapabilityOutcome::Done(()));
            }
            state.pending_approval = None;
        }
        let reply = match decision {
            ApprovalDecision::Accept => &self.rules.approve_reply,
            ApprovalDecision::AcceptForSession => &self.rules.approve_for_session_reply,
            ApprovalDecision::Reject | ApprovalDecision::Cancel => &self.rules.reject_reply,
        };
        let mut line = reply.clone();
        line.push('\n');
        self.process.write(line.as_bytes()).await?;
        Ok(CapabilityOutcome::Done(()))
    }

    async fn list_models(&self) -> Result<CapabilityOutcome<ModelCatalog>, AdapterError> {
        if !self.capabilities.model_list || self.models.is_empty() {
            return Ok(CapabilityOutcome::Unsupported);
        }
        Ok(CapabilityOutcome::Done(ModelCatalog {
            default_model: self
                .models
                .iter()
                .find(|model| model.is_default)
                .map(|model| model.id.clone()),
            models: self.models.clone(),
        }))
    }

    async fn shutdown(&self, grace: Duration) -> Option<ExitReason> {
        Some(self.process.shutdown(grace).await)
    }
}

struct LineClassifier {
    rules: Arc<HeadlessRules>,
    state: Arc<Mutex<LineState>>,
    discarding: watch::Sender<bool>,
    events: mpsc::Sender<AdapterEvent>,
    next_approval: u64,
}

impl LineClassifier {
    /// Translate one output line. Returns the event to emit, if any.
    fn classify(&mut self, line: &str) -> Option<AdapterEvent> {
        let class = self.rules.classify(line);
        if *self.discarding.borrow() {
            if class == LineClass::TurnCompleted {
                self.discarding.send_replace(false);
            }
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let backend_turn_id = state.current_turn.clone();
        match class {
            LineClass::Ignored => None,
            LineClass::TurnCompleted => {
                state.pending_approval = None;
                // The first prompt shows up before any turn was sent.
                let backend_turn_id = state.current_turn.take()?;
                Some(AdapterEvent::TurnCompleted {
                    backend_turn_id: Some(backend_turn_id),
                    outcome: BackendTurnOutcome::Completed,
                })
            }
            LineClass::ApprovalRequest { command } => {
                if backend_turn_id.is_none() {
                    return Some(AdapterEvent::Diagnostic {
                        message: line.to_string(),
                    });
                }
                self.next_approval += 1;
                let id = ApprovalId::new(RequestId::String(format!(
                    "headless-approval-{}",
                    self.next_approval
                )));
                state.pending_approval = Some(id.clone());
                Some(AdapterEvent::ApprovalRequested {
                    backend_turn_id,
                    approval: PendingApproval {
                        id,
                        kind: ApprovalKind::CommandExecution,
                        details: json!({ "command": command, "line": line }),
                    },
                })
            }
            LineClass::ToolStarted { tool } => {
                progress(backend_turn_id, ProgressKind::ToolStarted, tool, line)
            }
            LineClass::Error { message } => {
                progress(backend_turn_id, ProgressKind::Error, message, line)
            }
            LineClass::Text(text) => progress(backend_turn_id, ProgressKind::Text, text, line),
        }
    }
}

/// Progress for the current turn, or a diagnostic when no turn is running.
fn progress(
    backend_turn_id: Option<String>,
    kind: ProgressKind,
    delta: String,
    line: &str,
) -> Option<AdapterEvent> {
    Some(match backend_turn_id {
        Some(backend_turn_id) => AdapterEvent::Progress {
            backend_turn_id: Some(backend_turn_id),
            progress: TurnProgress::delta(kind, delta),
        },
        None => AdapterEvent::Diagnostic {
            message: line.to_string(),
        },
    })
}

type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

async fn read_lines(
    mut classifier: LineClassifier,
    stdout: OutputStream,
    stderr: OutputStream,
    process: Arc<ProcessHandle>,
    grace: Duration,
) {
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let (mut stdout_buf, mut stderr_buf) = (Vec::new(), Vec::new());
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let line = tokio::select! {
            line = read_line_lossy(&mut stdout, &mut stdout_buf), if stdout_open => match line {
                Ok(Some(line)) => line,
                Ok(None) => { stdout_open = false; continue; }
                Err(err) => {
                    tracing::debug!(error = %err, "Headless stdout read failed");
                    stdout_open = false;
                    continue;
                }
            },
            line = read_line_lossy(&mut stderr, &mut stderr_buf), if stderr_open => match line {
                Ok(Some(line)) => line,
                Ok(None) => { stderr_open = false; continue; }
                Err(err) => {
                    tracing::debug!(error = %err, "Headless stderr read failed");
                    stderr_open = false;
                    continue;
                }
            },
        };
        if let Some(event) = classifier.classify(&line)
            && classifier.events.send(event).await.is_err()
        {
            tracing::debug!("Headless event receiver dropped");
        }
    }

    let reason = match tokio::time::timeout(grace, process.wait()).await {
        Ok(reason) => reason,
        Err(_) => process.shutdown(grace).await,
    };
    tracing::info!(program = %process.program(), exit = %reason.label(), "Headless backend exited");
    let _ = classifier.events.send(AdapterEvent::Exited { reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::BackendKind;
    use crate::error::BindingError;
    use crate::rules::HeadlessPatterns;

    fn classifier(
        current_turn: Option<&str>,
    ) -> Result<(LineClassifier, mpsc::Receiver<AdapterEvent>), BindingError> {
        let rules = HeadlessRules::compile(&HeadlessPatterns::for_backend(BackendKind::Custom))?;
        let (events, rx) = mpsc::channel(8);
        let (discarding, _) = watch::channel(false);
        let state = LineState {
            current_turn: current_turn.map(str::to_string),
            pending_approval: None,
        };
        Ok((
            LineClassifier {
                rules: Arc::new(rules),
                state: Arc::new(Mutex::new(state)),
                discarding,
                events,
                next_approval: 0,
            },
            rx,
        ))
    }

    #[test]
    fn unrecognized_lines_are_text_progress() -> Result<(), BindingError> {
        let (mut classifier, _rx) = classifier(Some("headless-turn-1"))?;
        assert_eq!(
            classifier.classify("warning: something odd happened"),
            Some(AdapterEvent::Progress {
                backend_turn_id: Some("headless-turn-1".to_string()),
                progress: TurnProgress::delta(
                    ProgressKind::Text,
                    "warning: something odd happened"
                ),
            })
        );
        Ok(())
    }

    #[test]
    fn approval_lines_get_synthesized_ids() -> anyhow::Result<()> {
        let (mut classifier, _rx) = classifier(Some("headless-turn-1"))?;
        let Some(AdapterEvent::ApprovalRequested { approval, .. }) =
            classifier.classify("Allow command: git push? [y/n]")
        else {
            anyhow::bail!("approval line was not recognized");
        };
        assert_eq!(
            approval.id,
            ApprovalId::new(RequestId::String("headless-approval-1".to_string()))
        );
        assert_eq!(approval.details["command"], "git push");
        Ok(())
    }

    #[test]
    fn prompt_completes_only_a_running_turn() -> Result<(), BindingError> {
        let (mut classifier, _rx) = classifier(None)?;
        assert_eq!(classifier.classify("> "), None);

        let (mut classifier, _rx) = self::classifier(Some("headless-turn-2"))?;
        assert_eq!(
            classifier.classify("> "),
            Some(AdapterEvent::TurnCompleted {
                backend_turn_id: Some("headless-turn-2".to_string()),
                outcome: BackendTurnOutcome::Completed,
            })
        );
        assert_eq!(classifier.classify("> "), None);
        Ok(())
    }

    #[test]
    fn output_is_discarded_until_the_prompt_returns() -> Result<(), BindingError> {
        let (mut classifier, _rx) = classifier(None)?;
        classifier.discarding.send_replace(true);
        assert_eq!(classifier.classify("partial answer that was cut off"), None);
        assert_eq!(classifier.classify("> "), None);
        assert!(!*classifier.discarding.borrow());
        assert!(matches!(
            classifier.classify("late line"),
            Some(AdapterEvent::Diagnostic { .. })
        ));
        Ok(())
    }
}
