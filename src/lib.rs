//! A client for threshold cryptography networks.
//!
//! A network is a fixed set of independently operated nodes. Each holds one
//! share of the network's keys, so no node can sign or decrypt alone. To get
//! anything done, a client asks every node, collects enough partial results
//! (*shares*), and combines them into one usable artifact: a signature, or a
//! plaintext.
//!
//! The network tolerates a minority of nodes failing or lying, and so does
//! this client. It never waits on the slowest node, and never trusts a
//! combined result it has not verified.
//!
//! # Design
//!
//! Everything starts with a *handshake*. The client contacts every bootstrap
//! node concurrently, under a single deadline. Each node answers with its
//! encryption key and its view of the network: the network's public keys,
//! the current epoch, a recent block hash. The client keeps the per node
//! answers, and takes the majority view of the network as its configuration.
//! The number of shares needed for every later operation is fixed here:
//! ```ignore
//! threshold = max(minimum_threshold, floor(2 * connected / 3))
//! ```
//!
//! Then, every operation follows the same path:
//!
//! - A fresh set of encryption keys is derived for this operation only.
//! - One request per connected node is built, carrying a session signature
//! bound to that node and to the most it may charge, and encrypted to that
//! node alone.
//! - Requests are sent concurrently. The operation moves on as soon as
//! `threshold` nodes have answered successfully; slower nodes are not waited for.
//! - Answers are decrypted, and the shares they carry are interpolated into
//! one result, which is then verified.
//!
//! When this fails in a way that means the client's view of the network is
//! stale (a node no longer knows the key a request was encrypted to, a node
//! could not be reached, too few valid shares came back), the handshake is
//! redone and the operation runs once more.
//!
//! ## Shares
//!
//! Shares are points on a polynomial whose value at zero is the result, each
//! tagged with the identifier of the node that produced it. Any `threshold`
//! of them determine the result, whatever order they arrive in:
//! ```ignore
//! s = sum(lambda_i(S) * s_i for i in S)
//! ```
//! For ECDSA, the points are shares of the signature's `s`, with the nonce
//! point `R` common to all of them. For BLS, they are shares of the signature
//! itself, in G2.
//!
//! ## Operations
//!
//! - [`Client::pkp_sign`] signs with a programmable key pair (PKP), using
//! ECDSA over secp256k1 or P-256.
//! - [`Client::encrypt`] and [`Client::decrypt`] implement access controlled
//! encryption. Data is encrypted locally to an identity derived from the
//! access conditions, and the network only hands out the identity's
//! decryption key when those conditions hold.
//! - [`Client::execute_js`] runs a Lit Action on every node, combining any
//! signatures it produces.
//! - [`Client::sign_session_key`] has the network delegate a session key on
//! behalf of a PKP.
//!
//! ## Collaborators
//!
//! Contracts, wallets, access condition schemas and caches are reached
//! through the traits in [`external`]. Node communication goes through
//! [`protocol::NodeTransport`], which defaults to JSON over HTTP.
//!
//! # Shortcomings
//!
//! - Stragglers of a batch are not cancelled once a quorum is reached; their
//! results are simply ignored.
//! - Node errors are summarized locally; the detail a node attaches to a
//! failure is only as good as what it chose to report.
pub mod attestation;
pub mod auth;
mod client;
pub mod combine;
mod compat;
pub mod config;
pub mod e2ee;
pub mod error;
pub mod external;
pub mod handshake;
pub mod jit;
mod math;
pub mod ops;
mod participants;
pub mod protocol;
pub mod retry;
mod serde;
#[cfg(test)]
mod test;

pub use client::{Client, ClientBuilder};
pub use compat::{eth_address, SigningCurve};
pub use config::{ClientConfig, HandshakePolicy};
pub use error::{Error, Result};
pub use handshake::HandshakeResult;
pub use protocol::{NodeUrl, Participant};
