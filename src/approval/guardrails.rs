use super::types::ApprovalKind;
use crate::plan::{Sensitivity, ToolParams};
use serde_json::Value;
use std::collections::BTreeMap;

/// Tool/action pairs that destroy state or take the host down.
const DESTRUCTIVE_ACTIONS: &[(&str, &[&str])] = &[
    ("file_operations", &["delete"]),
    ("system_control", &["shutdown", "restart", "sleep"]),
    ("process_management", &["kill", "terminate"]),
    ("security_operations", &["change_permissions", "modify_firewall"]),
];

/// Tool/action pairs that always need a human look.
const SENSITIVE_ACTIONS: &[(&str, &[&str])] = &[
    ("file_operations", &["write", "move"]),
    (
        "system_control",
        &["stop_service", "restart_service", "disable_service"],
    ),
    ("automation_operations", &["create", "schedule", "run", "delete"]),
];

/// Tools that are sensitive regardless of action.
const SENSITIVE_TOOLS: &[&str] = &[
    "keyboard_mouse",
    "credentials_manager",
    "send_email",
    "schedule_task",
    "shell",
];

fn action_of(fields: &BTreeMap<String, Value>) -> &str {
    fields
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("execute")
}

fn listed(table: &[(&str, &[&str])], tool: &str, action: &str) -> bool {
    table
        .iter()
        .any(|(name, actions)| *name == tool && actions.contains(&action))
}

/// Guardrail classification of a tool call from its flat field view.
pub fn classify(tool: &str, fields: &BTreeMap<String, Value>) -> Sensitivity {
    let action = action_of(fields);
    if listed(DESTRUCTIVE_ACTIONS, tool, action) {
        return Sensitivity::Destructive;
    }
    if listed(SENSITIVE_ACTIONS, tool, action) || SENSITIVE_TOOLS.contains(&tool) {
        return Sensitivity::Sensitive;
    }
    if tool == "system_control" {
        return Sensitivity::Sensitive;
    }
    Sensitivity::Normal
}

pub fn classify_params(params: &ToolParams) -> Sensitivity {
    classify(params.tool_name(), &params.fields())
}

/// Guardrails can only raise the planner's classification.
pub fn effective_sensitivity(declared: Sensitivity, params: &ToolParams) -> Sensitivity {
    declared.max(classify_params(params))
}

pub fn infer_kind(tool: &str, fields: &BTreeMap<String, Value>, sensitivity: Sensitivity) -> ApprovalKind {
    let action = action_of(fields);
    match (tool, action) {
        ("file_operations", "write" | "delete" | "move" | "copy") => ApprovalKind::FileWrite,
        ("shell", _) | ("system_control", "execute") | ("automation_operations", "run") => {
            ApprovalKind::Execution
        }
        _ if sensitivity.requires_approval() => ApprovalKind::SensitiveAction,
        _ => ApprovalKind::Permission,
    }
}

fn text<'a>(fields: &'a BTreeMap<String, Value>, key: &str) -> &'a str {
    fields.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Human-readable description of a tool call.
pub fn describe(tool: &str, fields: &BTreeMap<String, Value>) -> String {
    let action = action_of(fields);
    let described = match tool {
        "file_operations" => {
            let path = match text(fields, "path") {
                "" => "unknown path",
                path => path,
            };
            match text(fields, "destination") {
                "" => format!("File operation: {action} on {path}"),
                dest => format!("File operation: {action} {path} -> {dest}"),
            }
        }
        "keyboard_mouse" => {
            let detail = match text(fields, "text") {
                "" => text(fields, "key"),
                typed => typed,
            };
            format!("Input: {action} - {detail}")
        }
        "system_control" => match text(fields, "service_name") {
            "" => format!("System: {action}"),
            service => format!("System: {action} {service}"),
        },
        "process_management" => {
            let target = match text(fields, "name") {
                "" => fields
                    .get("pid")
                    .and_then(Value::as_u64)
                    .map(|pid| pid.to_string())
                    .unwrap_or_default(),
                name => name.to_string(),
            };
            format!("Process: {action} {target}")
        }
        "network_diagnostics" => format!("Network: {action} {}", text(fields, "host")),
        "shell" => format!("Shell: {}", text(fields, "command")),
        _ => format!("{tool}: {action}"),
    };
    described.trim_end().to_string()
}
