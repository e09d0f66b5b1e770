// Operator escalation: when to ask a human, what to show them, and how
// their answer feeds back into the run

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::classifier::ErrorKind;
use crate::error::{EscalationError, ReboundError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub attempt_threshold: u32,
    pub strategy_threshold: usize,
    /// Escalations allowed per run before the gate stays shut
    pub max_per_run: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            attempt_threshold: 5,
            strategy_threshold: 3,
            max_per_run: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorChoice {
    /// Retry with a different strategy
    Retry,
    Skip,
    /// Retry with operator-supplied guidance
    Guidance,
    Abort,
}

impl OperatorChoice {
    pub const MENU: [OperatorChoice; 4] = [
        OperatorChoice::Retry,
        OperatorChoice::Skip,
        OperatorChoice::Guidance,
        OperatorChoice::Abort,
    ];
}

/// What the operator is shown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationPayload {
    pub task_id: String,
    pub action: String,
    pub error: String,
    pub error_kind: ErrorKind,
    pub strategies_tried: Vec<String>,
    pub attempts: u32,
    pub options: Vec<OperatorChoice>,
}

/// The operator's answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationResolution {
    pub choice: OperatorChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_text: Option<String>,
}

impl EscalationResolution {
    pub fn retry() -> Self {
        Self {
            choice: OperatorChoice::Retry,
            guidance_text: None,
        }
    }

    pub fn skip() -> Self {
        Self {
            choice: OperatorChoice::Skip,
            guidance_text: None,
        }
    }

    pub fn guidance(text: impl Into<String>) -> Self {
        Self {
            choice: OperatorChoice::Guidance,
            guidance_text: Some(text.into()),
        }
    }

    pub fn abort() -> Self {
        Self {
            choice: OperatorChoice::Abort,
            guidance_text: None,
        }
    }

    /// Validate the answer and turn it into something the executor can apply
    pub fn into_action(self) -> Result<ResolvedAction> {
        match self.choice {
            OperatorChoice::Retry => Ok(ResolvedAction::RetryDifferently),
            OperatorChoice::Skip => Ok(ResolvedAction::Skip),
            OperatorChoice::Abort => Ok(ResolvedAction::Abort),
            OperatorChoice::Guidance => match self.guidance_text {
                Some(text) if !text.trim().is_empty() => Ok(ResolvedAction::RetryWithGuidance(text)),
                _ => Err(ReboundError::Escalation(Box::new(
                    EscalationError::MissingGuidance,
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    RetryDifferently,
    Skip,
    RetryWithGuidance(String),
    Abort,
}

/// Per-run escalation gate
#[derive(Debug)]
pub struct EscalationGate {
    config: EscalationConfig,
    used: AtomicU32,
}

impl EscalationGate {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            used: AtomicU32::new(0),
        }
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u32 {
        self.config.max_per_run.saturating_sub(self.used())
    }

    /// True once either threshold is reached and the run still has budget
    pub fn should_escalate(&self, attempts: u32, distinct_strategies_tried: usize) -> bool {
        let over = attempts >= self.config.attempt_threshold
            || distinct_strategies_tried >= self.config.strategy_threshold;
        over && self.remaining() > 0
    }

    /// Claim one escalation slot and build the payload; `None` when the
    /// per-run budget is spent.
    pub fn escalate(
        &self,
        task_id: &str,
        action: &str,
        error: &str,
        error_kind: ErrorKind,
        strategies_tried: Vec<String>,
        attempts: u32,
    ) -> Option<EscalationPayload> {
        let max = self.config.max_per_run;
        let claimed = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max).then_some(used + 1)
            })
            .is_ok();
        if !claimed {
            warn!(task_id = %task_id, max_per_run = max, "Escalation budget exhausted");
            return None;
        }
        info!(
            task_id = %task_id,
            action = %action,
            kind = %error_kind,
            strategies = strategies_tried.len(),
            "Escalating to operator"
        );
        Some(EscalationPayload {
            task_id: task_id.to_string(),
            action: action.to_string(),
            error: error.to_string(),
            error_kind,
            strategies_tried,
            attempts,
            options: OperatorChoice::MENU.to_vec(),
        })
    }
}

/// Operator-facing layer
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn resolve(&self, payload: EscalationPayload) -> Result<EscalationResolution>;
}

pub type EscalationRequest = (EscalationPayload, oneshot::Sender<EscalationResolution>);

/// Forwards escalations over a channel to whatever drives the operator UI
#[derive(Debug, Clone)]
pub struct ChannelEscalationHandler {
    sender: mpsc::Sender<EscalationRequest>,
}

impl ChannelEscalationHandler {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<EscalationRequest>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EscalationHandler for ChannelEscalationHandler {
    async fn resolve(&self, payload: EscalationPayload) -> Result<EscalationResolution> {
        let action = payload.action.clone();
        let closed = || {
            ReboundError::Escalation(Box::new(EscalationError::ChannelClosed {
                action: action.clone(),
            }))
        };
        let (reply, answer) = oneshot::channel();
        self.sender
            .send((payload, reply))
            .await
            .map_err(|_| closed())?;
        answer.await.map_err(|_| closed())
    }
}
