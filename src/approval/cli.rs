use super::ApprovalBroker;
use super::types::{ApprovalRequest, BrokerResponse, RememberScope};
use anyhow::Result;
use console::style;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub struct CliApprovalBroker {
    timeout: Duration,
}

impl CliApprovalBroker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn default_timeout() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

fn response_for(input: char) -> BrokerResponse {
    match input.to_ascii_lowercase() {
        'a' => BrokerResponse::approve(),
        'd' => BrokerResponse::deny("denied by user"),
        's' => BrokerResponse::approve().remember(RememberScope::Session),
        'p' => BrokerResponse::approve().remember(RememberScope::Persistent),
        other => BrokerResponse::deny(format!("unrecognized input: '{other}'")),
    }
}

impl ApprovalBroker for CliApprovalBroker {
    fn request_approval<'a>(
        &'a self,
        request: &'a ApprovalRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BrokerResponse>> + Send + 'a>> {
        Box::pin(async move {
            eprintln!();
            eprintln!(
                "┌─ {} ─────────────────────────",
                style("Approval Required").yellow().bold()
            );
            eprintln!("│ Kind:    {}", request.kind);
            eprintln!("│ Action:  {}", request.description);
            eprintln!("│ Risk:    {}", style(request.sensitivity).red());
            for (name, value) in &request.payload.fields {
                if value.is_null() {
                    continue;
                }
                let marker = if request.payload.is_editable(name) { "*" } else { " " };
                eprintln!("│ {marker}{name}: {value}");
            }
            eprintln!("├──────────────────────────────────────────────────");
            eprintln!("│ [A]pprove  [D]eny  Approve [S]ession  Approve [P]ersistent");
            eprintln!("└──────────────────────────────────────────────────");
            eprint!("  > ");

            match tokio::time::timeout(self.timeout, read_single_char()).await {
                Ok(Ok(ch)) => Ok(response_for(ch)),
                Ok(Err(e)) => Ok(BrokerResponse::deny(format!("input error: {e}"))),
                Err(_) => Ok(BrokerResponse::deny("approval timed out")),
            }
        })
    }
}

async fn read_single_char() -> Result<char> {
    let ch = tokio::task::spawn_blocking(|| {
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        input
            .trim()
            .chars()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no input received"))
    })
    .await??;
    Ok(ch)
}
