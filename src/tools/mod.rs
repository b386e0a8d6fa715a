use crate::plan::ToolParams;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::watch;

/// Result of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            data: Value::Null,
            message: String::new(),
            error: Some(error),
        }
    }

    /// Error text of a failed result, falling back to the message.
    pub fn failure_text(&self) -> String {
        self.error
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| {
                if self.message.is_empty() {
                    "tool reported failure".to_string()
                } else {
                    self.message.clone()
                }
            })
    }
}

/// Cooperative cancellation for in-flight invocations.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the sender
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// External tool invocation registry.
pub trait ToolInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        tool_name: &'a str,
        params: &'a ToolParams,
        cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ToolResult>> + Send + 'a>>;
}

/// Invoker that never touches the OS: every call succeeds and echoes its
/// parameters back as data.
pub struct DryRunInvoker;

impl ToolInvoker for DryRunInvoker {
    fn invoke<'a>(
        &'a self,
        tool_name: &'a str,
        params: &'a ToolParams,
        cancel: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ToolResult>> + Send + 'a>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            let data = serde_json::to_value(params)?;
            tracing::info!(tool = tool_name, action = %params.action_name(), "dry run");
            Ok(ToolResult::ok(
                data,
                format!("dry run: {tool_name}.{}", params.action_name()),
            ))
        })
    }
}
