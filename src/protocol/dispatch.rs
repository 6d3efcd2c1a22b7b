//! Fan a batch of requests out to the nodes and wait for a quorum.
//!
//! Each request runs as its own task. The batch resolves as soon as enough
//! requests have succeeded; the remaining tasks are left to finish on their
//! own and their outcomes are ignored.
use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::{Error, NodeErrorSummary, Result},
    protocol::{most_common, NodeReply, NodeTransport, NodeUrl, RequestItem},
};

/// A successful answer from one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResponse {
    pub url: NodeUrl,
    pub body: Value,
}

/// The outcome of a dispatched batch.
#[derive(Debug)]
pub enum BatchResult<T> {
    Success { values: Vec<T> },
    Failure { error: Error },
}

impl<T> BatchResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchResult::Success { .. })
    }

    pub fn into_result(self) -> Result<Vec<T>> {
        match self {
            BatchResult::Success { values } => Ok(values),
            BatchResult::Failure { error } => Err(error),
        }
    }
}

pub(crate) fn most_common_error(errors: &[(NodeUrl, NodeErrorSummary)]) -> Option<&NodeErrorSummary> {
    most_common(errors.iter().map(|(_, e)| e))
}

/// Send every request concurrently and resolve once `min_success_count` succeed.
///
/// An empty batch succeeds trivially when nothing is required, and is an input
/// error otherwise. When every request settles without reaching the threshold,
/// the failure carries the most common node error along with every node's
/// error keyed by url.
pub async fn dispatch(
    transport: Arc<dyn NodeTransport>,
    requests: Vec<RequestItem>,
    request_id: &str,
    min_success_count: usize,
) -> BatchResult<NodeResponse> {
    if requests.is_empty() {
        if min_success_count == 0 {
            return BatchResult::Success { values: Vec::new() };
        }
        return BatchResult::Failure {
            error: Error::InvalidInput(
                "Request array is empty, but minSuccessCount > 0.".to_string(),
            ),
        };
    }

    let total_requests = requests.len();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for request in requests {
        let tx = tx.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let outcome = match transport.send(&request).await {
                Ok(body) => match NodeReply::from_body(body) {
                    NodeReply::Success(body) => Ok(body),
                    NodeReply::Failure(summary) => Err(summary),
                },
                Err(e) => Err(NodeErrorSummary::from(&e)),
            };
            // Nobody is listening anymore once the batch has resolved.
            let _ = tx.send((request.target_url, outcome));
        });
    }
    drop(tx);

    let mut values = Vec::with_capacity(min_success_count);
    let mut failures = Vec::new();
    if min_success_count == 0 {
        return BatchResult::Success { values };
    }
    while let Some((url, outcome)) = rx.recv().await {
        match outcome {
            Ok(body) => {
                values.push(NodeResponse { url, body });
                if values.len() >= min_success_count {
                    debug!(
                        request_id,
                        successes = values.len(),
                        failures = failures.len(),
                        total_requests,
                        "batch reached quorum"
                    );
                    return BatchResult::Success { values };
                }
            }
            Err(summary) => {
                warn!(request_id, %url, error = %summary, "node request failed");
                failures.push((url, summary));
            }
        }
    }

    let Some(representative) = most_common_error(&failures).cloned() else {
        return BatchResult::Failure {
            error: Error::InsufficientSuccessNoError {
                request_id: request_id.to_string(),
                success_count: values.len(),
                failure_count: 0,
                min_success_count,
                total_requests,
            },
        };
    };
    warn!(
        request_id,
        successes = values.len(),
        failures = failures.len(),
        min_success_count,
        error = %representative,
        "batch failed to reach quorum"
    );
    let node_errors: BTreeMap<_, _> = failures.into_iter().collect();
    BatchResult::Failure {
        error: Error::AggregatedNodeError {
            request_id: request_id.to_string(),
            representative,
            node_errors,
        },
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{error::TransportError, protocol::Endpoint};

    #[derive(Clone)]
    pub(crate) enum Behavior {
        Ok(Duration),
        NodeError(Duration, &'static str, &'static str),
        Unreachable,
    }

    /// Answers from a fixed script, keyed by node url.
    pub(crate) struct ScriptedTransport {
        pub behaviors: HashMap<NodeUrl, Behavior>,
        pub completed: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new(behaviors: impl IntoIterator<Item = (&'static str, Behavior)>) -> Self {
            Self {
                behaviors: behaviors
                    .into_iter()
                    .map(|(u, b)| (NodeUrl::from(u), b))
                    .collect(),
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NodeTransport for ScriptedTransport {
        async fn send(&self, request: &RequestItem) -> Result<Value, TransportError> {
            let behavior = self
                .behaviors
                .get(&request.target_url)
                .cloned()
                .unwrap_or(Behavior::Unreachable);
            let out = match behavior {
                Behavior::Ok(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(json!({"success": true, "data": {"from": request.target_url}}))
                }
                Behavior::NodeError(delay, name, message) => {
                    tokio::time::sleep(delay).await;
                    Ok(json!({"success": false, "error": {"name": name, "message": message}}))
                }
                Behavior::Unreachable => Err(TransportError::Network("connection refused".into())),
            };
            self.completed.fetch_add(1, Ordering::SeqCst);
            out
        }
    }

    fn requests(urls: &[&str]) -> Vec<RequestItem> {
        urls.iter()
            .map(|u| RequestItem {
                target_url: NodeUrl::from(*u),
                endpoint: Endpoint::PkpSign,
                path: "/web/pkp/sign/v2".to_string(),
                payload: json!({}),
                request_id: "req".to_string(),
                epoch: 1,
                version: "test".to_string(),
            })
            .collect()
    }

    const URLS: [&str; 5] = ["http://n1", "http://n2", "http://n3", "http://n4", "http://n5"];

    #[tokio::test]
    async fn test_empty_batches() {
        let transport = Arc::new(ScriptedTransport::new([]));
        let out = dispatch(transport.clone(), vec![], "req", 0).await;
        assert!(matches!(out, BatchResult::Success { ref values } if values.is_empty()));
        let out = dispatch(transport, vec![], "req", 1).await;
        match out {
            BatchResult::Failure { error } => assert_eq!(error.kind(), "InvalidInput"),
            BatchResult::Success { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_resolves_at_quorum_without_waiting_for_stragglers() {
        let fast = Duration::from_millis(1);
        let slow = Duration::from_millis(300);
        let transport = Arc::new(ScriptedTransport::new([
            (URLS[0], Behavior::Ok(fast)),
            (URLS[1], Behavior::Ok(fast)),
            (URLS[2], Behavior::Ok(fast)),
            (URLS[3], Behavior::Ok(slow)),
            (URLS[4], Behavior::Ok(slow)),
        ]));
        let out = dispatch(transport.clone(), requests(&URLS), "req", 3).await;
        let values = out.into_result().unwrap();
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|v| v.url != NodeUrl::from(URLS[3])));
        // The slow requests were not cancelled.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(transport.completed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failure_picks_most_common_error() {
        let d = Duration::from_millis(1);
        let transport = Arc::new(ScriptedTransport::new([
            (URLS[0], Behavior::Ok(d)),
            (URLS[1], Behavior::NodeError(d, "NodeError", "A")),
            (URLS[2], Behavior::NodeError(d, "NodeError", "A")),
            (URLS[3], Behavior::NodeError(d, "NodeError", "A")),
            (URLS[4], Behavior::NodeError(d, "NodeError", "B")),
        ]));
        let out = dispatch(transport, requests(&URLS), "req", 3).await;
        match out {
            BatchResult::Failure {
                error:
                    Error::AggregatedNodeError {
                        representative,
                        node_errors,
                        ..
                    },
            } => {
                assert_eq!(representative.message, "A");
                assert_eq!(node_errors.len(), 4);
                assert_eq!(node_errors[&NodeUrl::from(URLS[4])].message, "B");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_majority() {
        let d = Duration::from_millis(1);
        let transport = Arc::new(ScriptedTransport::new([
            (URLS[0], Behavior::Ok(d)),
            (URLS[1], Behavior::NodeError(d, "RateLimited", "slow down")),
            (URLS[2], Behavior::Ok(d)),
            (URLS[3], Behavior::NodeError(d, "RateLimited", "slow down")),
            (URLS[4], Behavior::NodeError(d, "RateLimited", "slow down")),
        ]));
        let error = dispatch(transport, requests(&URLS), "req", 3)
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(error.kind(), "AggregatedNodeError");
        assert_eq!(error.summary().name, "RateLimited");
        assert_eq!(error.node_errors().map(|m| m.len()), Some(3));
    }

    #[tokio::test]
    async fn test_unreachable_nodes_are_summarized() {
        let transport = Arc::new(ScriptedTransport::new([]));
        let out = dispatch(transport, requests(&URLS[..2]), "req", 2).await;
        let error = out.into_result().unwrap_err();
        assert_eq!(error.summary().name, "NetworkError");
        assert_eq!(error.node_errors().map(|m| m.len()), Some(2));
    }

    #[test]
    fn test_most_common_tie_goes_to_first_seen() {
        let a = NodeErrorSummary::new("E", "a");
        let b = NodeErrorSummary::new("E", "b");
        let errors = vec![
            (NodeUrl::from("1"), b.clone()),
            (NodeUrl::from("2"), a.clone()),
            (NodeUrl::from("3"), a.clone()),
            (NodeUrl::from("4"), b.clone()),
        ];
        assert_eq!(most_common_error(&errors), Some(&b));
        assert_eq!(most_common_error(&[]), None);
    }
}
