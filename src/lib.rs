//! Binder DNS - a DNS frontend for a ZooKeeper-backed service directory.
//!
//! Services register themselves as nodes in a coordination store. This crate
//! mirrors one subtree of that store into memory and answers DNS queries
//! from the mirror: A records for hosts and databases, A and SRV records for
//! load-balanced services, and PTR records for registered addresses. Names
//! it does not own can be forwarded to resolvers in peer datacenters.
//!
//! ## Features
//!
//! - Watch-driven, incremental mirror of the directory tree
//! - A/SRV answers with glue, shuffled per query
//! - PTR answers from a local reverse index
//! - Root referrals for names outside the configured zone
//! - Best-effort cross-datacenter recursion with bounded concurrency
//! - Graceful shutdown support
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          binder-dns                             │
//! │                                                                 │
//! │  ┌──────────────────┐ events ┌──────────────────┐               │
//! │  │ Directory client │───────▶│    TreeCache     │               │
//! │  │ (ZooKeeper)      │◀───────│  (single writer) │               │
//! │  └──────────────────┘ watch  └────────┬─────────┘               │
//! │                                       │ lookup                  │
//! │                                       ▼                         │
//! │  ┌──────────────────┐  miss  ┌──────────────────┐               │
//! │  │    Recursion     │◀───────│     Resolver     │               │
//! │  │ (peer resolvers) │        └────────┬─────────┘               │
//! │  └──────────────────┘                 │                         │
//! │                                       ▼                         │
//! │                              ┌──────────────────┐               │
//! │                              │  Hickory DNS     │◀── UDP/TCP    │
//! │                              │  Server          │    :53        │
//! │                              └──────────────────┘               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! _http._tcp.bar.foo.com SRV
//!   → path /com/foo/bar
//!   → service record (_http, _tcp, port 80)
//!   → one SRV per member, glue A in additional
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use binder_dns::memory::MemoryDirectory;
//! use binder_dns::{Config, DnsServer};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = serde_json::from_str(
//!         r#"{"dns": {"listen_addr": "127.0.0.1:5353", "dns_domain": "foo.com"}}"#,
//!     )
//!     .unwrap();
//!
//!     let (directory, events) = MemoryDirectory::new();
//!     directory.put("/com/foo/db", r#"{"type":"database","database":{"primary":"tcp://u@10.0.0.1/pg"}}"#);
//!     directory.establish_session();
//!
//!     let (_stop, shutdown) = watch::channel(false);
//!     DnsServer::new(config)
//!         .run_with_directory(Arc::new(directory), events, shutdown)
//!         .await
//!         .unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod directory;
pub mod error;
pub mod handler;
pub mod hints;
pub mod interfaces;
pub mod memory;
pub mod metrics;
pub mod name;
pub mod record;
pub mod recursion;
pub mod resolver;
pub mod server;
pub mod sync;
pub mod telemetry;
pub mod tree;
pub mod upstream;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

// Re-export main types
pub use config::{Config, DirectoryConfig, DnsConfig, RecursionConfig, TelemetryConfig};
pub use directory::{Directory, DirectoryEvent};
pub use error::{BinderError, DirectoryError};
pub use handler::BinderHandler;
pub use record::Record;
pub use server::DnsServer;
pub use tree::TreeCache;
