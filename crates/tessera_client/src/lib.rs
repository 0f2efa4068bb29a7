//! # Tessera Client
//!
//! Client, request engine and sync loop for a federated (Matrix-style) chat
//! protocol.
//!
//! This crate provides:
//! - A [`Client`] that owns the device identity and exposes room operations
//! - A stateless request engine that turns a [`Request`] into one
//!   authenticated HTTP call and exactly one typed outcome
//! - A supervised long-poll sync loop that persists its cursor through the
//!   [`tessera_storage`] contract and reports errors without terminating
//! - An HTTP transport abstraction with a reqwest implementation and a
//!   scriptable mock for tests
//!
//! ## Architecture
//!
//! Every operation is one request-engine call plus response interpretation.
//! The sync loop runs as an independent tokio task per client, sharing the
//! client's identity and storage; storage transactions are the single point
//! of mutual exclusion between the loop and concurrent operations.
//!
//! ## Key Invariants
//!
//! - Exactly one outcome per request, never retried by the engine itself
//! - A sync cursor is persisted only in the same transaction that applied
//!   the response it came from
//! - The sync loop never terminates on a reported error; transient failures
//!   degrade to "report and retry" with bounded backoff
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera_client::{Client, ReqwestHttpClient};
//! use tessera_storage::MemoryStorage;
//!
//! # async fn run() -> Result<(), tessera_client::ClientError> {
//! let storage = Arc::new(MemoryStorage::new());
//! let http = Arc::new(ReqwestHttpClient::new());
//! let client = Client::log_in(
//!     "alice",
//!     "secret",
//!     "https://matrix.example.org",
//!     storage,
//!     http,
//! )
//! .await?;
//!
//! let room_id = client.join_room("#tessera:example.org").await?;
//! client.send_message("hello from tessera", &room_id).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod http;
mod request;
mod sync;

pub use client::{Client, SyncErrorHandler};
pub use config::{RetryConfig, SyncOptions};
pub use error::{ClientError, ClientResult, ResponseBody};
pub use http::{HttpClient, MockHttpClient, RawRequest, RawResponse, ReqwestHttpClient};
pub use request::{Method, Request, Response};
