//! User-approval request / grant / deny lifecycle.
//!
//! When policy returns `AskUser`, the orchestrator creates an approval
//! request and blocks on `wait_for_decision` until the channel collaborator
//! calls `grant` or `deny`, or the bounded timeout elapses. A timeout is a
//! denial — never a silent allow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::schema::ToolCallRequest;

// ─── Approval types ───────────────────────────────────────────────────────────

/// Current status of a pending approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Granted,
    Denied,
    TimedOut,
}

/// A single approval request awaiting a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Stable unique ID for this request.
    pub id: String,
    /// Tool call this approval gates.
    pub request_id: String,
    pub session_id: String,
    pub tool: String,
    /// Why policy asked: the matched rule's reason.
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

// ─── Approval router ──────────────────────────────────────────────────────────

/// Manages in-flight approval requests and notifies waiters of decisions.
pub struct ApprovalRouter {
    requests: Arc<Mutex<HashMap<String, ApprovalRequest>>>,
    /// Broadcast channel — every update sends the `approval_id`.
    tx: broadcast::Sender<String>,
}

impl Default for ApprovalRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalRouter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            requests: Arc::new(Mutex::new(HashMap::new())),
            tx,
        }
    }

    /// Submit an approval request for a gated tool call.
    ///
    /// Returns the stable `approval_id` that callers use to poll or wait.
    pub async fn request_approval(
        &self,
        request: &ToolCallRequest,
        reason: impl Into<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let approval = ApprovalRequest {
            id: id.clone(),
            request_id: request.id.to_string(),
            session_id: request.session_id.clone(),
            tool: request.tool.clone(),
            reason: reason.into(),
            requested_at: Utc::now(),
            status: ApprovalStatus::Pending,
        };

        self.requests.lock().await.insert(id.clone(), approval);
        id
    }

    /// Grant an approval request and notify all waiters.
    pub async fn grant(&self, approval_id: &str) -> anyhow::Result<()> {
        self.resolve(approval_id, ApprovalStatus::Granted).await
    }

    /// Deny an approval request and notify all waiters.
    pub async fn deny(&self, approval_id: &str) -> anyhow::Result<()> {
        self.resolve(approval_id, ApprovalStatus::Denied).await
    }

    async fn resolve(&self, approval_id: &str, status: ApprovalStatus) -> anyhow::Result<()> {
        let mut requests = self.requests.lock().await;
        let req = requests
            .get_mut(approval_id)
            .ok_or_else(|| anyhow::anyhow!("approval '{}' not found", approval_id))?;

        if req.status != ApprovalStatus::Pending {
            anyhow::bail!(
                "approval '{}' is already in state {:?}",
                approval_id,
                req.status
            );
        }

        req.status = status;
        drop(requests);

        // Best-effort notify; no receivers is fine.
        let _ = self.tx.send(approval_id.to_string());
        Ok(())
    }

    /// Block until the given approval has a non-`Pending` status or the
    /// timeout elapses. A timeout marks the request `TimedOut`.
    pub async fn wait_for_decision(&self, approval_id: &str, timeout: Duration) -> ApprovalStatus {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Check current status first.
            {
                let requests = self.requests.lock().await;
                if let Some(req) = requests.get(approval_id) {
                    if req.status != ApprovalStatus::Pending {
                        return req.status.clone();
                    }
                } else {
                    // Not found — treat as denied.
                    return ApprovalStatus::Denied;
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.mark_timed_out(approval_id).await;
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(id)) if id == approval_id => {
                    // Re-check status in next loop iteration.
                }
                Ok(Ok(_)) => {
                    // Different approval — keep waiting.
                }
                Ok(Err(_)) | Err(_) => {
                    // Channel lagged or timeout elapsed.
                    return self.mark_timed_out(approval_id).await;
                }
            }
        }
    }

    async fn mark_timed_out(&self, approval_id: &str) -> ApprovalStatus {
        let mut requests = self.requests.lock().await;
        match requests.get_mut(approval_id) {
            Some(req) => {
                if req.status == ApprovalStatus::Pending {
                    req.status = ApprovalStatus::TimedOut;
                }
                req.status.clone()
            }
            None => ApprovalStatus::TimedOut,
        }
    }

    /// Look up an approval request by ID.
    pub async fn get(&self, approval_id: &str) -> Option<ApprovalRequest> {
        self.requests.lock().await.get(approval_id).cloned()
    }

    /// All currently pending requests, for the channel collaborator to render.
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        self.requests
            .lock()
            .await
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> ToolCallRequest {
        ToolCallRequest::new("shell_exec", json!({"command": "git push"}), "s1", 3)
    }

    #[tokio::test]
    async fn grant_changes_status() {
        let router = ApprovalRouter::new();
        let id = router.request_approval(&call(), "push requires approval").await;

        router.grant(&id).await.expect("grant");
        let req = router.get(&id).await.expect("request exists");
        assert_eq!(req.status, ApprovalStatus::Granted);
    }

    #[tokio::test]
    async fn deny_changes_status() {
        let router = ApprovalRouter::new();
        let id = router.request_approval(&call(), "push requires approval").await;

        router.deny(&id).await.expect("deny");
        let req = router.get(&id).await.expect("request exists");
        assert_eq!(req.status, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn double_resolve_fails() {
        let router = ApprovalRouter::new();
        let id = router.request_approval(&call(), "reason").await;
        router.grant(&id).await.expect("grant");
        assert!(router.deny(&id).await.is_err());
    }

    #[tokio::test]
    async fn wait_returns_granted() {
        let router = Arc::new(ApprovalRouter::new());
        let id = router.request_approval(&call(), "reason").await;

        let router2 = Arc::clone(&router);
        let id2 = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            router2.grant(&id2).await.expect("grant");
        });

        let status = router
            .wait_for_decision(&id, Duration::from_millis(500))
            .await;
        assert_eq!(status, ApprovalStatus::Granted);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let router = ApprovalRouter::new();
        let id = router.request_approval(&call(), "reason").await;

        let status = router
            .wait_for_decision(&id, Duration::from_millis(50))
            .await;
        assert_eq!(status, ApprovalStatus::TimedOut);
    }

    #[tokio::test]
    async fn unknown_approval_waits_as_denied() {
        let router = ApprovalRouter::new();
        let status = router
            .wait_for_decision("no-such-id", Duration::from_millis(50))
            .await;
        assert_eq!(status, ApprovalStatus::Denied);
    }
}
