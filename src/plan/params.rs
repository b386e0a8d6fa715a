use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileAction {
    Read,
    List,
    Info,
    Write,
    Move,
    Copy,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SystemInfoAction {
    General,
    Cpu,
    Memory,
    Disk,
    Network,
    Overview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessAction {
    List,
    Info,
    Kill,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetworkAction {
    Ping,
    Dns,
    Traceroute,
    Ports,
    Connections,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SystemControlAction {
    Lock,
    Sleep,
    Restart,
    Shutdown,
    StartService,
    StopService,
    RestartService,
    DisableService,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SecurityAction {
    Scan,
    Audit,
    ChangePermissions,
    ModifyFirewall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AutomationAction {
    List,
    Run,
    Create,
    Schedule,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MonitoringAction {
    Status,
    Start,
    Stop,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InputAction {
    Type,
    Press,
    Click,
    Move,
}

/// Parameters of one tool invocation, one variant per declared tool schema.
///
/// The variant tag doubles as the tool name handed to the invocation
/// registry, so a step can never name one tool and carry another's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolParams {
    FileOperations {
        action: FileAction,
        path: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        destination: Option<String>,
    },
    SystemInfo {
        action: SystemInfoAction,
    },
    ProcessManagement {
        action: ProcessAction,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        name: Option<String>,
    },
    NetworkDiagnostics {
        action: NetworkAction,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
    },
    SystemControl {
        action: SystemControlAction,
        #[serde(default)]
        service_name: Option<String>,
        #[serde(default)]
        command: Option<String>,
    },
    SecurityOperations {
        action: SecurityAction,
        #[serde(default)]
        target: Option<String>,
    },
    AutomationOperations {
        action: AutomationAction,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        schedule: Option<String>,
    },
    MonitoringOperations {
        action: MonitoringAction,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        condition: Option<String>,
        #[serde(default)]
        threshold: Option<f64>,
    },
    KeyboardMouse {
        action: InputAction,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        key: Option<String>,
    },
    Shell {
        command: String,
    },
}

fn require(field: &Option<String>, tool: &str, action: &str, name: &str) -> Result<()> {
    match field.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(()),
        _ => Err(EngineError::PlanInvalid(format!(
            "{tool}.{action} requires '{name}'"
        ))),
    }
}

impl ToolParams {
    /// Registry name of the tool these parameters belong to.
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::FileOperations { .. } => "file_operations",
            Self::SystemInfo { .. } => "system_info",
            Self::ProcessManagement { .. } => "process_management",
            Self::NetworkDiagnostics { .. } => "network_diagnostics",
            Self::SystemControl { .. } => "system_control",
            Self::SecurityOperations { .. } => "security_operations",
            Self::AutomationOperations { .. } => "automation_operations",
            Self::MonitoringOperations { .. } => "monitoring_operations",
            Self::KeyboardMouse { .. } => "keyboard_mouse",
            Self::Shell { .. } => "shell",
        }
    }

    pub fn action_name(&self) -> String {
        match self {
            Self::FileOperations { action, .. } => action.to_string(),
            Self::SystemInfo { action } => action.to_string(),
            Self::ProcessManagement { action, .. } => action.to_string(),
            Self::NetworkDiagnostics { action, .. } => action.to_string(),
            Self::SystemControl { action, .. } => action.to_string(),
            Self::SecurityOperations { action, .. } => action.to_string(),
            Self::AutomationOperations { action, .. } => action.to_string(),
            Self::MonitoringOperations { action, .. } => action.to_string(),
            Self::KeyboardMouse { action, .. } => action.to_string(),
            Self::Shell { .. } => "execute".to_string(),
        }
    }

    /// The resource an invocation acts upon, when it has one.
    pub fn target(&self) -> Option<String> {
        match self {
            Self::FileOperations { path, .. } => Some(path.clone()),
            Self::SystemInfo { .. } => None,
            Self::ProcessManagement { pid, name, .. } => name
                .clone()
                .or_else(|| pid.map(|pid| pid.to_string())),
            Self::NetworkDiagnostics { host, port, .. } => match (host, port) {
                (Some(host), Some(port)) => Some(format!("{host}:{port}")),
                (Some(host), None) => Some(host.clone()),
                (None, Some(port)) => Some(port.to_string()),
                (None, None) => None,
            },
            Self::SystemControl {
                service_name,
                command,
                ..
            } => service_name.clone().or_else(|| command.clone()),
            Self::SecurityOperations { target, .. } => target.clone(),
            Self::AutomationOperations { name, .. } | Self::MonitoringOperations { name, .. } => {
                name.clone()
            }
            Self::KeyboardMouse { text, key, .. } => key.clone().or_else(|| text.clone()),
            Self::Shell { command } => Some(command.clone()),
        }
    }

    /// Check the per-action required fields of the declared schema.
    pub fn validate(&self) -> Result<()> {
        let tool = self.tool_name();
        let action = self.action_name();
        match self {
            Self::FileOperations {
                action: file_action,
                path,
                content,
                destination,
            } => {
                if path.trim().is_empty() {
                    return Err(EngineError::PlanInvalid(format!(
                        "{tool}.{action} requires 'path'"
                    )));
                }
                match file_action {
                    FileAction::Write => require(content, tool, &action, "content"),
                    FileAction::Move | FileAction::Copy => {
                        require(destination, tool, &action, "destination")
                    }
                    _ => Ok(()),
                }
            }
            Self::SystemInfo { .. } => Ok(()),
            Self::ProcessManagement { action: proc_action, pid, name } => match proc_action {
                ProcessAction::List => Ok(()),
                _ if pid.is_some() => Ok(()),
                _ => require(name, tool, &action, "pid' or 'name"),
            },
            Self::NetworkDiagnostics {
                action: net_action,
                host,
                ..
            } => match net_action {
                NetworkAction::Ping | NetworkAction::Dns | NetworkAction::Traceroute => {
                    require(host, tool, &action, "host")
                }
                _ => Ok(()),
            },
            Self::SystemControl {
                action: control,
                service_name,
                command,
            } => match control {
                SystemControlAction::StartService
                | SystemControlAction::StopService
                | SystemControlAction::RestartService
                | SystemControlAction::DisableService => {
                    require(service_name, tool, &action, "service_name")
                }
                SystemControlAction::Execute => require(command, tool, &action, "command"),
                _ => Ok(()),
            },
            Self::SecurityOperations {
                action: sec_action,
                target,
            } => match sec_action {
                SecurityAction::ChangePermissions | SecurityAction::ModifyFirewall => {
                    require(target, tool, &action, "target")
                }
                _ => Ok(()),
            },
            Self::AutomationOperations {
                action: auto_action,
                name,
                command,
                schedule,
            } => match auto_action {
                AutomationAction::List => Ok(()),
                AutomationAction::Create => {
                    require(name, tool, &action, "name")?;
                    require(command, tool, &action, "command")
                }
                AutomationAction::Schedule => {
                    require(name, tool, &action, "name")?;
                    require(schedule, tool, &action, "schedule")
                }
                AutomationAction::Run | AutomationAction::Delete => {
                    require(name, tool, &action, "name")
                }
            },
            Self::MonitoringOperations {
                action: mon_action,
                name,
                ..
            } => match mon_action {
                MonitoringAction::Start | MonitoringAction::Alert => {
                    require(name, tool, &action, "name")
                }
                _ => Ok(()),
            },
            Self::KeyboardMouse {
                action: input,
                text,
                key,
            } => match input {
                InputAction::Type => require(text, tool, &action, "text"),
                InputAction::Press => require(key, tool, &action, "key"),
                _ => Ok(()),
            },
            Self::Shell { command } => {
                if command.trim().is_empty() {
                    Err(EngineError::PlanInvalid("shell requires 'command'".into()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Flat field view used for approval payloads. The `tool` tag is omitted.
    pub fn fields(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().filter(|(key, _)| key != "tool").collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Apply field edits and re-parse against the same tool schema.
    pub fn with_fields(&self, edits: &BTreeMap<String, Value>) -> Result<Self> {
        if edits.contains_key("tool") {
            return Err(EngineError::PlanInvalid(
                "the tool of a step cannot be edited".into(),
            ));
        }
        let mut value = serde_json::to_value(self).map_err(anyhow::Error::from)?;
        if let Value::Object(map) = &mut value {
            for (key, edited) in edits {
                map.insert(key.clone(), edited.clone());
            }
        }
        let edited: Self = serde_json::from_value(value)
            .map_err(|error| EngineError::PlanInvalid(format!("edited parameters: {error}")))?;
        edited.validate()?;
        Ok(edited)
    }
}
