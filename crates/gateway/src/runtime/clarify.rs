//! Clarification timeout/default resolution (C13).
//!
//! At-most-one-outstanding-per-run falls out of the agent loop's structure:
//! tool calls within a step execute sequentially and only one run exists per
//! `platformKey` (the C8 busy gate), so no separate tracking is needed here.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use agentrt_domain::error::{Error, Result};
use agentrt_domain::tool::ClarificationRequest;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Await `answer`, bounded by `request.timeout_ms` if set. On timeout,
/// resolves with `request.default_answer` if present, else raises a
/// tool-visible timeout error.
pub async fn resolve_with_timeout<F>(request: &ClarificationRequest, answer: F) -> Result<String>
where
    F: Future<Output = Result<String>>,
{
    let Some(ms) = request.timeout_ms else {
        return answer.await;
    };

    match tokio::time::timeout(Duration::from_millis(ms), answer).await {
        Ok(result) => result,
        Err(_) => request.default_answer.clone().ok_or_else(|| {
            Error::Timeout(format!("clarification '{}' timed out", request.id))
        }),
    }
}

/// Cross-endpoint delivery for clarification answers: the dispatcher
/// registers a `streamId` while the loop is blocked on `on_clarification_request`,
/// and the platform adapter's answer endpoint (`POST /api/clarify/{streamId}`,
/// or the CLI's next readline) resolves it by the same key.
#[derive(Default)]
pub struct ClarificationHub {
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl ClarificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `stream_id`, replacing any stale one left over from a
    /// prior, already-resolved request on the same stream.
    pub fn register(&self, stream_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(stream_id.to_string(), tx);
        rx
    }

    /// Deliver `answer` to the waiting request, if one is still open.
    /// Returns `false` if nothing was pending (already timed out, or no
    /// request was ever issued for this stream).
    pub fn answer(&self, stream_id: &str, answer: String) -> bool {
        match self.pending.lock().remove(stream_id) {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    /// Drop a slot without answering it (called once the loop call that
    /// opened it returns, so a late `answer()` for an old request id is a
    /// harmless no-op rather than a leak).
    pub fn cancel(&self, stream_id: &str) {
        self.pending.lock().remove(stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(timeout_ms: Option<u64>, default_answer: Option<&str>) -> ClarificationRequest {
        ClarificationRequest {
            id: "c1".to_string(),
            prompt: "which file?".to_string(),
            default_answer: default_answer.map(str::to_string),
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn resolves_immediately_when_no_timeout_configured() {
        let req = request(None, None);
        let result = resolve_with_timeout(&req, async { Ok("answer".to_string()) }).await;
        assert_eq!(result.unwrap(), "answer");
    }

    #[tokio::test]
    async fn falls_back_to_default_on_timeout() {
        let req = request(Some(10), Some("default answer"));
        let result = resolve_with_timeout(&req, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        })
        .await;
        assert_eq!(result.unwrap(), "default answer");
    }

    #[tokio::test]
    async fn raises_timeout_error_without_default() {
        let req = request(Some(10), None);
        let result = resolve_with_timeout(&req, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn propagates_answer_error_before_timeout() {
        let req = request(Some(5_000), None);
        let result: Result<String> =
            resolve_with_timeout(&req, async { Err(Error::Cancelled) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
