//! Execution planning — maps a request onto the argv its sandbox session runs.
//!
//! Every category executes as a process inside the session, so isolation is
//! uniform: file tools run standard utilities against the writable root,
//! shell tools run the command itself, network tools run the fetcher. Paths
//! must be relative and traversal-free — escapes are rejected here before a
//! session is even created, and the mount scope enforces the same boundary
//! structurally.

use std::path::{Component, Path};

use thiserror::Error;

use crate::schema::ToolCallRequest;
use crate::tools::{ToolCategory, ToolDescriptor};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("missing required argument '{0}'")]
    MissingArg(&'static str),

    #[error("path '{0}' escapes the granted scope")]
    PathEscape(String),

    #[error("url '{0}' has no recognizable host")]
    BadUrl(String),
}

/// A ready-to-run sandbox invocation plus the hosts it will contact.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub argv: Vec<String>,
    /// Actual destinations, compared against the manifest by the egress
    /// filter after execution.
    pub hosts: Vec<String>,
}

impl ExecutionPlan {
    fn local(argv: Vec<String>) -> Self {
        Self {
            argv,
            hosts: Vec::new(),
        }
    }
}

/// Build the execution plan for an approved request.
pub fn build_plan(
    request: &ToolCallRequest,
    tool: &ToolDescriptor,
) -> Result<ExecutionPlan, PlanError> {
    match tool.category {
        ToolCategory::FileRead => {
            if request.tool == "search_files" {
                let query = string_arg(request, "query")?;
                return Ok(ExecutionPlan::local(vec![
                    "grep".into(),
                    "-rn".into(),
                    "--".into(),
                    query,
                    ".".into(),
                ]));
            }
            let path = scoped_path(request, "path")?;
            Ok(ExecutionPlan::local(vec!["cat".into(), "--".into(), path]))
        }

        ToolCategory::MemoryRead => {
            let key = string_arg(request, "key")?;
            let path = scoped_rel(&format!("memory/{key}.json"))?;
            Ok(ExecutionPlan::local(vec!["cat".into(), "--".into(), path]))
        }

        ToolCategory::FileWrite | ToolCategory::MemoryWrite => {
            let (path, content) = if tool.category == ToolCategory::MemoryWrite {
                let key = string_arg(request, "key")?;
                (
                    scoped_rel(&format!("memory/{key}.json"))?,
                    string_arg(request, "value")?,
                )
            } else {
                (scoped_path(request, "path")?, string_arg(request, "content")?)
            };
            // printf through sh keeps arbitrary content out of shell parsing.
            Ok(ExecutionPlan::local(vec![
                "sh".into(),
                "-c".into(),
                r#"mkdir -p "$(dirname "$2")" && printf '%s' "$1" > "$2""#.into(),
                "sh".into(),
                content,
                path,
            ]))
        }

        ToolCategory::FileDelete => {
            let path = scoped_path(request, "path")?;
            Ok(ExecutionPlan::local(vec!["rm".into(), "--".into(), path]))
        }

        ToolCategory::ShellExec | ToolCategory::SkillExec => {
            let command = string_arg(request, "command")?;
            Ok(ExecutionPlan::local(vec![
                "sh".into(),
                "-c".into(),
                command,
            ]))
        }

        ToolCategory::NetworkRequest => {
            let url = string_arg(request, "url")?;
            let host = url_host(&url).ok_or_else(|| PlanError::BadUrl(url.clone()))?;
            let timeout = tool.manifest.max_runtime_seconds.to_string();
            Ok(ExecutionPlan {
                argv: vec![
                    "curl".into(),
                    "-sS".into(),
                    "--max-time".into(),
                    timeout,
                    "--".into(),
                    url,
                ],
                hosts: vec![host],
            })
        }

        ToolCategory::SystemInfo => Ok(ExecutionPlan::local(vec!["uname".into(), "-a".into()])),
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn string_arg(request: &ToolCallRequest, key: &'static str) -> Result<String, PlanError> {
    request
        .args
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or(PlanError::MissingArg(key))
}

fn scoped_path(request: &ToolCallRequest, key: &'static str) -> Result<String, PlanError> {
    scoped_rel(&string_arg(request, key)?)
}

/// Accept only relative, traversal-free paths. The session's mount scope
/// enforces the same boundary; this check just fails earlier and cheaper.
fn scoped_rel(path: &str) -> Result<String, PlanError> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(PlanError::PathEscape(path.to_string()));
    }
    for component in candidate.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PlanError::PathEscape(path.to_string()));
            }
            _ => {}
        }
    }
    if path.contains('\0') {
        return Err(PlanError::PathEscape(path.to_string()));
    }
    Ok(path.to_string())
}

/// Extract the host from a URL without a full parser: strip the scheme, cut
/// at the first `/`, drop userinfo and port.
fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority
        .rsplit_once('@')
        .map(|(_, h)| h)
        .unwrap_or(authority);
    let host = host.split(':').next()?.to_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}
