//! Per-operation state: fresh encryption keys and node prices.
//!
//! A [`JitContext`] is derived from the current handshake every time an
//! operation starts. Its client secrets never leave the process and are
//! never reused by another operation.
use std::{collections::BTreeMap, fmt};

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    error::{Error, Result},
    handshake::HandshakeResult,
    protocol::NodeUrl,
    serde::{decode_hex, pad_key},
};

/// Encryption keys for talking to one node.
pub struct NodeKeys {
    pub node_public_key: [u8; 32],
    client_secret: StaticSecret,
}

impl NodeKeys {
    pub fn new(node_public_key: [u8; 32], client_secret: StaticSecret) -> Self {
        Self {
            node_public_key,
            client_secret,
        }
    }

    pub fn client_public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.client_secret).to_bytes()
    }

    pub(crate) fn client_secret(&self) -> &StaticSecret {
        &self.client_secret
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("node_public_key", &hex::encode(self.node_public_key))
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Encryption keys for every node of an operation.
#[derive(Debug, Default)]
pub struct KeySet {
    keys: BTreeMap<NodeUrl, NodeKeys>,
}

impl KeySet {
    /// Add the keys for a node.
    ///
    /// Responses are matched to nodes by identity key, so two nodes sharing
    /// one is an error.
    pub fn insert(&mut self, url: NodeUrl, keys: NodeKeys) -> Result<()> {
        if let Some((other, _)) = self
            .keys
            .iter()
            .find(|(u, k)| **u != url && k.node_public_key == keys.node_public_key)
        {
            return Err(Error::InvalidInput(format!(
                "nodes {} and {} share the identity key {}",
                other,
                url,
                hex::encode(keys.node_public_key)
            )));
        }
        self.keys.insert(url, keys);
        Ok(())
    }

    pub fn get(&self, url: &NodeUrl) -> Option<&NodeKeys> {
        self.keys.get(url)
    }

    /// Find the keys whose node public key matches a response's verification key.
    pub fn by_node_key(&self, node_public_key: &[u8; 32]) -> Option<&NodeKeys> {
        self.keys
            .values()
            .find(|k| &k.node_public_key == node_public_key)
    }

    pub fn urls(&self) -> impl Iterator<Item = &NodeUrl> {
        self.keys.keys()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// What an operation buys from the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Product {
    Decryption = 0,
    Sign = 1,
    LitAction = 2,
    SignSessionKey = 3,
}

impl Product {
    pub fn id(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePrice {
    pub url: NodeUrl,
    /// The node's staking address, as reported by the price feed.
    pub address: String,
    pub price: u128,
}

impl NodePrice {
    /// Parse the price list returned by the price feed.
    ///
    /// Entries look like `{ "url": ..., "address": ..., "prices": [..] }`, with
    /// one price per product.
    pub fn parse_feed(value: &Value, product: Product) -> Result<Vec<NodePrice>> {
        let entries = value
            .as_array()
            .ok_or_else(|| Error::Chain("price feed did not return a list".to_string()))?;
        entries
            .iter()
            .map(|entry| {
                let url = entry
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Chain("price feed entry without url".to_string()))?;
                let address = entry
                    .get("address")
                    .and_then(Value::as_str)
                    .unwrap_or(url);
                let price = entry
                    .get("prices")
                    .and_then(|p| p.get(product.id() as usize))
                    .and_then(|p| match p {
                        Value::String(s) => s.parse::<u128>().ok(),
                        other => other.as_u64().map(u128::from),
                    })
                    .ok_or_else(|| {
                        Error::Chain(format!("price feed entry for {} has no price", url))
                    })?;
                Ok(NodePrice {
                    url: NodeUrl::from(url),
                    address: address.to_string(),
                    price,
                })
            })
            .collect()
    }
}

/// The most a node may charge for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMaxPrice {
    pub url: NodeUrl,
    pub address: String,
    pub max_price: u128,
}

#[derive(Debug, Clone)]
pub struct PricingContext {
    pub product: Product,
    pub user_max_price: Option<u128>,
    pub node_prices: Vec<NodePrice>,
    pub threshold: usize,
}

impl PricingContext {
    /// Split the user's budget across the nodes.
    ///
    /// The cheapest `threshold` nodes must fit in the budget. Whatever is
    /// left over is split evenly between them and added to every node's
    /// price. Without a budget, every node is offered exactly its price.
    pub fn max_prices(&self) -> Result<Vec<NodeMaxPrice>> {
        let mut sorted: Vec<&NodePrice> = self.node_prices.iter().collect();
        sorted.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.url.cmp(&b.url)));
        if sorted.len() < self.threshold {
            return Err(Error::InvalidInput(format!(
                "only {} priced nodes for a threshold of {}",
                sorted.len(),
                self.threshold
            )));
        }

        let excess = match self.user_max_price {
            None => 0,
            Some(max) => {
                let base: u128 = sorted[..self.threshold].iter().map(|n| n.price).sum();
                if max < base {
                    return Err(Error::InvalidInput(format!(
                        "max price {} is below the {} needed by the {} cheapest nodes for {:?}",
                        max, base, self.threshold, self.product
                    )));
                }
                (max - base) / self.threshold.max(1) as u128
            }
        };

        Ok(sorted
            .into_iter()
            .map(|n| NodeMaxPrice {
                url: n.url.clone(),
                address: n.address.clone(),
                max_price: n.price.saturating_add(excess),
            })
            .collect())
    }
}

/// Everything an operation needs beyond the handshake itself.
#[derive(Debug)]
pub struct JitContext {
    pub key_set: KeySet,
    pub node_prices: Vec<NodePrice>,
}

impl JitContext {
    /// Derive a context from a handshake, with a fresh secret per node.
    ///
    /// Prices are restricted to the nodes that answered the handshake; nodes
    /// missing from the price list are offered for free.
    pub fn new(
        rng: &mut impl CryptoRngCore,
        handshake: &HandshakeResult,
        prices: Vec<NodePrice>,
    ) -> Result<Self> {
        let mut key_set = KeySet::default();
        for (url, response) in &handshake.server_keys {
            if !handshake.connected_nodes.contains(url) {
                continue;
            }
            let node_public_key = decode_hex(&response.node_identity_key)
                .ok()
                .and_then(|b| pad_key(&b))
                .ok_or_else(|| {
                    Error::InvalidInput(format!("node {} has a malformed identity key", url))
                })?;
            key_set.insert(
                url.clone(),
                NodeKeys::new(node_public_key, StaticSecret::random_from_rng(&mut *rng)),
            )?;
        }

        let mut node_prices: Vec<NodePrice> = prices
            .into_iter()
            .filter(|p| handshake.connected_nodes.contains(&p.url))
            .collect();
        for url in &handshake.connected_nodes {
            if !node_prices.iter().any(|p| &p.url == url) {
                node_prices.push(NodePrice {
                    url: url.clone(),
                    address: url.to_string(),
                    price: 0,
                });
            }
        }

        Ok(Self {
            key_set,
            node_prices,
        })
    }

    pub fn pricing(&self, product: Product, user_max_price: Option<u128>, threshold: usize) -> PricingContext {
        PricingContext {
            product,
            user_max_price,
            node_prices: self.node_prices.clone(),
            threshold,
        }
    }
}
