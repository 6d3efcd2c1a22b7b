//! Recovering from transient failures with a fresh handshake.
//!
//! A few failures mean the client's view of the network is stale: the nodes
//! moved to a new epoch, a node went away, or too few shares came back. For
//! those, the handshake is refreshed and the operation runs exactly once more.
use std::{future::Future, time::Duration};

use tracing::warn;

use crate::error::{CodecError, Error, NodeErrorSummary, Result, TransportError};

const MISSING_VERIFICATION_KEY: &str = "No secret key found for verification key";

const NO_VALID_SHARES_MESSAGES: [&str; 4] = [
    "no valid lit action shares to combine",
    "could not read key share",
    "unable to insert into key cache",
    "ecdsa signing failed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    MissingVerificationKey,
    NetworkFetchError,
    NoValidShares,
}

impl RetryReason {
    pub fn tag(self) -> &'static str {
        match self {
            RetryReason::MissingVerificationKey => "missing-verification-key",
            RetryReason::NetworkFetchError => "network-fetch-error",
            RetryReason::NoValidShares => "no-valid-shares",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub reason: Option<RetryReason>,
}

impl RetryDecision {
    /// Decide whether an error is worth a refresh and one more attempt.
    pub fn from_error(error: &Error) -> Self {
        let reason = classify(error);
        Self {
            should_retry: reason.is_some(),
            reason,
        }
    }
}

fn classify_message(message: &str) -> Option<RetryReason> {
    let lower = message.to_lowercase();
    if message.contains(MISSING_VERIFICATION_KEY) {
        Some(RetryReason::MissingVerificationKey)
    } else if lower.contains("fetch failed") {
        Some(RetryReason::NetworkFetchError)
    } else if NO_VALID_SHARES_MESSAGES.iter().any(|m| lower.contains(m)) {
        Some(RetryReason::NoValidShares)
    } else {
        None
    }
}

fn classify_summary(summary: &NodeErrorSummary) -> Option<RetryReason> {
    if summary.message.contains(MISSING_VERIFICATION_KEY) {
        return Some(RetryReason::MissingVerificationKey);
    }
    if summary.name == "NetworkError" || summary.code.as_deref() == Some("network_error") {
        return Some(RetryReason::NetworkFetchError);
    }
    if summary.name == "NoValidShares" {
        return Some(RetryReason::NoValidShares);
    }
    classify_message(&summary.message)
}

fn classify(error: &Error) -> Option<RetryReason> {
    match error {
        Error::Codec(CodecError::UnknownVerificationKey(_)) => {
            Some(RetryReason::MissingVerificationKey)
        }
        Error::Transport(TransportError::Network(_)) => Some(RetryReason::NetworkFetchError),
        Error::NoValidShares(_) => Some(RetryReason::NoValidShares),
        Error::OperationFailed { source, .. } => classify(source),
        Error::Node { summary, .. } => classify_summary(summary),
        Error::AggregatedNodeError { representative, .. } => classify_summary(representative),
        other => classify_message(&other.to_string()),
    }
}

/// Run an operation, refreshing the handshake and retrying once on a
/// recognized transient failure.
///
/// `refresh_context` receives a label of the form
/// `{operation}-{reason}-retry-1`. The retry's outcome is returned as is.
pub async fn execute_with_handshake<C, T, B, BFut, R, RFut, F, Fut>(
    operation: &str,
    backoff: Duration,
    mut build_context: B,
    refresh_context: R,
    mut runner: F,
) -> Result<T>
where
    B: FnMut() -> BFut,
    BFut: Future<Output = Result<C>>,
    R: FnOnce(String) -> RFut,
    RFut: Future<Output = Result<()>>,
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let context = build_context().await?;
    let error = match runner(context).await {
        Ok(out) => return Ok(out),
        Err(e) => e,
    };

    let Some(reason) = RetryDecision::from_error(&error).reason else {
        return Err(error);
    };
    warn!(operation, reason = reason.tag(), %error, "refreshing handshake before retrying");

    if reason != RetryReason::MissingVerificationKey && !backoff.is_zero() {
        tokio::time::sleep(backoff).await;
    }
    refresh_context(format!("{}-{}-retry-1", operation, reason.tag())).await?;
    let context = build_context().await?;
    runner(context).await
}
