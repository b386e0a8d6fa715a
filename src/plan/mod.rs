pub mod arena;
pub mod params;
pub mod planner;
pub mod types;

pub use arena::PlanArena;
pub use params::{
    AutomationAction, FileAction, InputAction, MonitoringAction, NetworkAction, ProcessAction,
    SecurityAction, SystemControlAction, SystemInfoAction, ToolParams,
};
pub use planner::{Planner, RetrySamePlanner};
pub use types::{Plan, PlanId, Sensitivity, Step, StepStatus};
