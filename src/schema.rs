//! `schema` — the tool-call boundary types.
//!
//! A [`ToolCallRequest`] is created by the agent brain and enters the pipeline
//! as an immutable value; the core never mutates it. A [`ToolCallResponse`]
//! is what goes back over the boundary: a status, optional output, and a
//! human-readable reason with no internal detail.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Requests ─────────────────────────────────────────────────────────────────

/// Files and hosts a tool claims it needs for this invocation. The sandbox
/// grants at most the intersection of this scope and the tool's manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeclaredScope {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// One proposed tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Stable unique ID, also used as the audit correlation id.
    pub id: Uuid,
    pub tool: String,
    /// Structured arguments as the agent produced them.
    pub args: serde_json::Value,
    pub session_id: String,
    /// Session autonomy dial at the moment of the request.
    pub autonomy_level: u8,
    #[serde(default)]
    pub declared_scope: DeclaredScope,
}

impl ToolCallRequest {
    pub fn new(
        tool: impl Into<String>,
        args: serde_json::Value,
        session_id: impl Into<String>,
        autonomy_level: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            args,
            session_id: session_id.into(),
            autonomy_level,
            declared_scope: DeclaredScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: DeclaredScope) -> Self {
        self.declared_scope = scope;
        self
    }

    /// Flatten the request into a resource string for policy matching:
    /// `tool:<most relevant argument>`.
    pub fn resource_string(&self) -> String {
        let mut parts = vec![self.tool.clone()];
        for key in ["path", "command", "url", "query"] {
            if let Some(value) = self.args.get(key).and_then(|v| v.as_str()) {
                let mut end = value.len().min(200);
                while !value.is_char_boundary(end) {
                    end -= 1;
                }
                parts.push(value[..end].to_string());
                break;
            }
        }
        parts.join(":")
    }
}

// ─── Responses ────────────────────────────────────────────────────────────────

/// Terminal status reported back across the tool-call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Approved but not executed by this core (caller runs it elsewhere).
    Allow,
    Deny,
    AskUser,
    Executed,
    Faulted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub status: CallStatus,
    /// Filtered output, present only for `Executed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub reason: String,
    /// Correlation id linking this response to its audit entries.
    pub correlation_id: String,
}

impl ToolCallResponse {
    pub fn denied(correlation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Deny,
            output: None,
            reason: reason.into(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn faulted(correlation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Faulted,
            output: None,
            reason: reason.into(),
            correlation_id: correlation_id.into(),
        }
    }
}
