//! Herald
//!
//! An S3 compatible reverse proxy that fronts heterogeneous object storage
//! backends and mirrors every mutating operation to the bucket's replicas.
//!
//! Clients speak the S3 REST dialect. Herald authenticates them, routes each
//! request to the bucket's primary backend, translating the protocol when
//! that backend is OpenStack Swift, answers from the primary, and enqueues
//! asynchronous replication tasks so the replicas converge.
//!
//! # Architecture
//!
//! - [`service`]: the front door handling CORS, auth and dispatch
//! - [`meta`]: URL style and bucket/key extraction
//! - [`sig_v4`]: AWS Signature Version 4, inbound and outbound
//! - [`backend`]: the S3 and Swift resolvers
//! - [`keystone`]: the Swift token store
//! - [`mirror`]: per bucket queues, workers, retry with backoff
//! - [`task_store`]: durable snapshots of queues and locks
//! - [`config`]: the config document and the bucket registry
//!
//! Replication is eventual: the client gets the primary's answer as soon as
//! it exists, replicas catch up from the queue.

#[macro_use]
mod error;

mod utils;

pub mod auth;
pub mod backend;
pub mod config;
pub mod cors;
pub mod header;
pub mod keystone;
pub mod meta;
pub mod mirror;
pub mod service;
pub mod sig_v4;
pub mod task_store;
pub mod xml;

pub use self::error::{ErrorSource, HeraldError, HeraldErrorCode, HeraldResult};
pub use self::service::{HeraldContext, HeraldService, HeraldServiceBuilder, RemoteAddr};
