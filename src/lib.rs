#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod approval;
pub mod breakpoints;
pub mod config;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod observability;
pub mod plan;
pub mod session;
pub mod snapshot;
pub mod tools;

pub use config::Config;
pub use engine::{EngineStatus, ExecutionEngine, RunOutcome};
pub use error::{EngineError, Result};
pub use session::{Session, SessionBuilder};
