// Tool invoker contract and run control handles

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// Browser/tool protocol client.
///
/// Implementations must surface failures as [`ToolError`], never as sentinel
/// values. Remediated calls carry the strategy under `_remediation` and
/// operator guidance under `_guidance` in `args`.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, args: &Value) -> Result<Value, ToolError>;
}

/// Pause and cancel handles for the run an executor is driving.
///
/// Pausing stops new dispatch and lets in-flight tasks finish. Cancelling
/// also abandons in-flight tasks; they are checkpointed as pending. A pause
/// or cancel applies to the run in progress: the next run or resume on the
/// same executor starts with fresh tokens.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    tokens: Arc<Mutex<RunTokens>>,
}

/// Token pair shared by every task of one run
#[derive(Debug, Clone, Default)]
pub(crate) struct RunTokens {
    pause: CancellationToken,
    cancel: CancellationToken,
}

impl RunTokens {
    pub(crate) fn is_paused(&self) -> bool {
        self.pause.is_cancelled()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.tokens.lock().pause.cancel();
    }

    pub fn cancel(&self) {
        let tokens = self.tokens.lock();
        tokens.pause.cancel();
        tokens.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.tokens.lock().is_paused()
    }

    pub fn is_cancelled(&self) -> bool {
        self.tokens.lock().is_cancelled()
    }

    /// Tokens for a run that is starting; tripped tokens left over from an
    /// earlier run are replaced
    pub(crate) fn arm(&self) -> RunTokens {
        let mut tokens = self.tokens.lock();
        if tokens.is_paused() || tokens.is_cancelled() {
            *tokens = RunTokens::default();
        }
        tokens.clone()
    }
}
