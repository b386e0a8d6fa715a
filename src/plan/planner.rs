use super::types::Step;
use crate::engine::ExecutionState;
use std::future::Future;
use std::pin::Pin;

/// External plan source. Natural-language interpretation lives behind this
/// seam; the engine only consumes ordered steps.
pub trait Planner: Send + Sync {
    /// Produce steps for `instruction`, seeded with the live state.
    fn plan<'a>(
        &'a self,
        instruction: &'a str,
        context: &'a ExecutionState,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Step>>> + Send + 'a>>;

    /// Alternate approach for one failed step. Scoped to that step only.
    fn revise_step<'a>(
        &'a self,
        failed: &'a Step,
        error: &'a str,
        context: &'a ExecutionState,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Step>> + Send + 'a>>;
}

/// Planner used when no external planner is wired in: redirection is refused
/// and a failed step is retried unchanged.
pub struct RetrySamePlanner;

impl Planner for RetrySamePlanner {
    fn plan<'a>(
        &'a self,
        instruction: &'a str,
        _context: &'a ExecutionState,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Step>>> + Send + 'a>> {
        Box::pin(async move { anyhow::bail!("no planner configured for '{instruction}'") })
    }

    fn revise_step<'a>(
        &'a self,
        failed: &'a Step,
        _error: &'a str,
        _context: &'a ExecutionState,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Step>> + Send + 'a>> {
        Box::pin(async move { Ok(failed.clone()) })
    }
}
