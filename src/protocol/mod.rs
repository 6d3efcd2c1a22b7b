//! Wire-level types shared by the handshake and the dispatcher.
//!
//! Every logical operation becomes one [`RequestItem`] per node, all tagged
//! with the same request id. Nodes answer with a JSON envelope which is either
//! `{ "success": true, "data": ... }` or `{ "success": false, "error": ... }`.
use std::{collections::HashMap, fmt, hash::Hash};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NodeErrorSummary;

pub mod dispatch;
pub mod transport;

pub use dispatch::{dispatch, BatchResult};
pub use transport::{HttpTransport, NodeTransport};

/// The endpoint of a single node, in `scheme://host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeUrl(String);

impl NodeUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append an API path to this node's base url.
    pub fn join(&self, path: &str) -> String {
        format!("{}{}", self.0.trim_end_matches('/'), path)
    }
}

impl From<&str> for NodeUrl {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeUrl {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The node API operations this client calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Handshake,
    SignSessionKey,
    ExecuteJs,
    PkpSign,
    EncryptionSign,
}

/// Represents a share holder in the network.
///
/// Each node holds one share of each network key, identified by this index.
/// The field element associated with the share is the index plus one, so that
/// no share ever sits at zero, where the secret itself lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct Participant(u32);

impl Participant {
    /// Return the scalar associated with this participant.
    pub fn scalar<F: ff::PrimeField>(&self) -> F {
        F::from(self.0 as u64 + 1)
    }
}

impl From<Participant> for u32 {
    fn from(p: Participant) -> Self {
        p.0
    }
}

impl From<u32> for Participant {
    fn from(x: u32) -> Self {
        Participant(x)
    }
}

/// One encrypted request addressed to one node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestItem {
    pub target_url: NodeUrl,
    pub endpoint: Endpoint,
    /// The API path, including any version suffix.
    pub path: String,
    pub payload: Value,
    pub request_id: String,
    pub epoch: u64,
    pub version: String,
}

impl RequestItem {
    pub fn url(&self) -> String {
        self.target_url.join(&self.path)
    }
}

/// A node reply, with the envelope stripped.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeReply {
    Success(Value),
    Failure(NodeErrorSummary),
}

impl NodeReply {
    /// Interpret a raw response body.
    ///
    /// Bodies without a `success` member are treated as bare successes, which
    /// is how the handshake endpoint answers and how encrypted payloads
    /// arrive. Any body that has the member is read as an envelope.
    pub fn from_body(body: Value) -> Self {
        if body.get("success").is_none() {
            return NodeReply::Success(body);
        }
        Self::from_envelope(body)
    }

    /// Interpret a body that must be a `{success, data | error}` envelope.
    ///
    /// A missing or non boolean `success` member is a failure.
    pub fn from_envelope(body: Value) -> Self {
        match body.get("success").and_then(Value::as_bool) {
            Some(true) => match body {
                Value::Object(mut map) => match map.remove("data") {
                    Some(data) => NodeReply::Success(data),
                    None => {
                        map.remove("success");
                        NodeReply::Success(Value::Object(map))
                    }
                },
                other => NodeReply::Success(other),
            },
            Some(false) => {
                let error = body.get("error").unwrap_or(&body);
                NodeReply::Failure(NodeErrorSummary::from_node_value(error))
            }
            None => NodeReply::Failure(NodeErrorSummary::new(
                "MalformedResponse",
                "response envelope has no boolean success member",
            )),
        }
    }
}

/// Count occurrences, remembering where each value was first seen.
fn tally<'a, T: Eq + Hash + 'a>(items: impl IntoIterator<Item = &'a T>) -> HashMap<&'a T, (usize, usize)> {
    let mut counts: HashMap<&T, (usize, usize)> = HashMap::new();
    for (i, item) in items.into_iter().enumerate() {
        counts.entry(item).or_insert((0, i)).0 += 1;
    }
    counts
}

/// The most frequent value, preferring the one seen first on ties.
pub fn most_common<'a, T: Eq + Hash + 'a>(items: impl IntoIterator<Item = &'a T>) -> Option<&'a T> {
    tally(items)
        .into_iter()
        .max_by(|(_, (c0, i0)), (_, (c1, i1))| c0.cmp(c1).then(i1.cmp(i0)))
        .map(|(v, _)| v)
}

/// The least frequent value, preferring the one seen first on ties.
pub fn least_common<'a, T: Eq + Hash + 'a>(items: impl IntoIterator<Item = &'a T>) -> Option<&'a T> {
    tally(items)
        .into_iter()
        .min_by(|(_, (c0, i0)), (_, (c1, i1))| c0.cmp(c1).then(i0.cmp(i1)))
        .map(|(v, _)| v)
}

/// Random hex of the given length, used for challenges.
pub(crate) fn random_hex(rng: &mut impl rand_core::CryptoRngCore, len: usize) -> String {
    let mut bytes = vec![0u8; (len + 1) / 2];
    rng.fill_bytes(&mut bytes);
    let mut out = hex::encode(bytes);
    out.truncate(len);
    out
}

pub(crate) fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
