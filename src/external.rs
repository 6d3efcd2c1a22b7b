//! The collaborators this crate talks to but does not implement.
//!
//! Contracts, condition schemas, wallets and caches all live elsewhere. Each
//! is reached through a narrow trait here, with a small implementation where
//! one is useful on its own.
use std::collections::HashMap;

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use tokio::sync::RwLock;

use crate::{
    compat::eth_address,
    error::{Error, Result},
    jit::{NodePrice, Product},
    serde::{decode, encode},
};

/// A transaction, once mined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: String,
    pub receipt: Value,
}

/// Typed access to the network's contracts.
#[async_trait]
pub trait ChainRegistry: Send + Sync {
    /// Call a view method.
    async fn read(&self, contract: &str, method: &str, args: Value) -> Result<Value>;

    /// Send a transaction and wait for its receipt.
    async fn write(&self, contract: &str, method: &str, args: Value) -> Result<TxReceipt>;
}

/// Read what every node currently charges for a product.
pub async fn fetch_node_prices(registry: &dyn ChainRegistry, product: Product) -> Result<Vec<NodePrice>> {
    let feed = registry
        .read("PriceFeed", "getNodesForRequest", json!([[product.id()]]))
        .await?;
    NodePrice::parse_feed(&feed, product)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub status: u16,
    pub message: String,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            status: 200,
            message: "ok".to_string(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Turn a rejection into an error.
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::AccessControl {
                status: self.status,
                message: self.message,
            })
        }
    }
}

/// Checks the shape of access control conditions before they are sent out.
pub trait AccessControlValidator: Send + Sync {
    fn validate(&self, conditions: &Value) -> ValidationOutcome;
}

/// Checks only the structure of conditions.
///
/// Conditions are a non empty list whose entries are conditions, nested lists,
/// or `{ "operator": "and" | "or" }` entries placed between two conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralValidator;

const CONDITION_FIELDS: [&str; 3] = ["conditionType", "returnValueTest", "chain"];

fn validate_list(items: &[Value], path: &str) -> std::result::Result<(), String> {
    if items.is_empty() {
        return Err(format!("{}: conditions must not be empty", path));
    }
    let mut expect_condition = true;
    for (i, item) in items.iter().enumerate() {
        let here = format!("{}[{}]", path, i);
        let is_operator = item.get("operator").is_some();
        if expect_condition == is_operator {
            return Err(format!(
                "{}: expected {}",
                here,
                if expect_condition { "a condition" } else { "an operator" }
            ));
        }
        match item {
            Value::Array(inner) => validate_list(inner, &here)?,
            Value::Object(map) if is_operator => match map.get("operator").and_then(Value::as_str) {
                Some("and") | Some("or") => {}
                _ => return Err(format!("{}: operator must be \"and\" or \"or\"", here)),
            },
            Value::Object(map) => {
                if !CONDITION_FIELDS.iter().any(|f| map.contains_key(*f)) {
                    return Err(format!("{}: not a condition", here));
                }
            }
            _ => return Err(format!("{}: unexpected {}", here, item)),
        }
        expect_condition = !expect_condition;
    }
    if expect_condition {
        return Err(format!("{}: conditions must not end with an operator", path));
    }
    Ok(())
}

impl AccessControlValidator for StructuralValidator {
    fn validate(&self, conditions: &Value) -> ValidationOutcome {
        let result = match conditions {
            Value::Array(items) => validate_list(items, "conditions"),
            _ => Err("conditions must be a list".to_string()),
        };
        match result {
            Ok(()) => ValidationOutcome::ok(),
            Err(message) => ValidationOutcome::rejected(message),
        }
    }
}

/// An account able to sign on a user's behalf.
///
/// Signatures are `r || s || v` hex strings, with `v` in `{27, 28}`.
#[async_trait]
pub trait MessageSigner: Send + Sync {
    fn address(&self) -> String;

    /// Sign a message with the EIP-191 personal message prefix.
    async fn sign_message(&self, message: &[u8]) -> Result<String>;

    /// Sign an already encoded transaction.
    async fn sign_transaction(&self, encoded: &[u8]) -> Result<String>;

    /// Sign EIP-712 typed data, given its domain separator and struct hash.
    async fn sign_typed_data(&self, domain_separator: &[u8; 32], struct_hash: &[u8; 32]) -> Result<String>;
}

/// The digest signed for an EIP-191 personal message.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

pub fn format_address(address: &[u8; 20]) -> String {
    format!("0x{}", hex::encode(address))
}

/// A wallet holding its key in memory.
pub struct LocalWallet {
    key: SigningKey,
}

impl LocalWallet {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut rand_core::OsRng))
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<String> {
        let (sig, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|e| Error::InvalidInput(format!("signing failed: {}", e)))?;
        let mut out = sig.to_bytes().to_vec();
        out.push(27 + recovery_id.to_byte());
        Ok(format!("0x{}", hex::encode(out)))
    }
}

#[async_trait]
impl MessageSigner for LocalWallet {
    fn address(&self) -> String {
        format_address(&eth_address(self.key.verifying_key().as_affine()))
    }

    async fn sign_message(&self, message: &[u8]) -> Result<String> {
        self.sign_digest(&eip191_hash(message))
    }

    async fn sign_transaction(&self, encoded: &[u8]) -> Result<String> {
        self.sign_digest(&Keccak256::digest(encoded).into())
    }

    async fn sign_typed_data(&self, domain_separator: &[u8; 32], struct_hash: &[u8; 32]) -> Result<String> {
        let mut hasher = Keccak256::new();
        hasher.update([0x19, 0x01]);
        hasher.update(domain_separator);
        hasher.update(struct_hash);
        self.sign_digest(&hasher.finalize().into())
    }
}

/// A byte oriented cache.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Read a value stored by [`store_value`].
pub async fn load_value<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => decode(&bytes).map(Some),
        None => Ok(None),
    }
}

pub async fn store_value<T: Serialize + Sync>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    store.set(key, encode(value)?).await
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
