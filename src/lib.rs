//! dyndns - Signed dynamic DNS updates.
//!
//! A client keeps a host's DNS record pointed at its current public
//! address. It discovers the address periodically, decides through a
//! convergence state machine whether DNS already reflects it, and if not
//! signs a claim and fans it out to every configured delivery channel.
//! A server receives claims from any channel, verifies them against the
//! host's trusted Ed25519 keys and writes the A/AAAA records, skipping
//! claims that are stale, already applied or already true.
//!
//! ## Architecture
//!
//! ```text
//!  client                                         server
//! ┌─────────────────────────────────┐           ┌──────────────────────────────┐
//! │ AddressResolver                 │           │ webhook (POST /update)       │
//! │       │                         │   http    │       │                      │
//! │       ▼                         │ ────────▶ │       ▼  mpsc                │
//! │ StateMachine ──▶ Reconciler ────┼──────────▶│ DyndnsServer::listen         │
//! │       ▲            │ dispatchers│  channel  │   validate → verify → age    │
//! │       │            └ retry tick │           │   → cache → lookup → write   │
//! │ AddressLookup (live DNS)        │           │       │                      │
//! └─────────────────────────────────┘           │       ▼                      │
//!                                               │ Propagator (A / AAAA)        │
//!                                               │       │                      │
//!                                               │       ▼                      │
//!  AddressLookup ◀──────── DNS (UDP/TCP) ───────│ MemoryZone ─▶ ZoneAuthority  │
//!                                               └──────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use dyndns::{DyndnsServer, MemoryZone, NoopNotifier};
//! use std::sync::Arc;
//! use tripwire::Tripwire;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = dyndns::Config::load("dyndns.toml".as_ref()).unwrap();
//!     let server_config = config.server.unwrap();
//!     let known_hosts = dyndns::server::decode_known_hosts(&server_config.known_hosts).unwrap();
//!
//!     let zone = MemoryZone::new(server_config.record_ttl);
//!     let server = DyndnsServer::new(
//!         known_hosts,
//!         Arc::new(zone.clone()),
//!         Arc::new(zone),
//!         Arc::new(NoopNotifier),
//!     )
//!     .unwrap();
//!
//!     let (tx, rx) = tokio::sync::mpsc::channel(64);
//!     let (tripwire, worker) = Tripwire::new_signals();
//!     tokio::spawn(worker);
//!
//!     Arc::new(server).run(rx, tripwire).await;
//! }
//! ```

#![warn(missing_docs)]

pub mod authority;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lookup;
pub mod metrics;
pub mod notification;
pub mod propagator;
pub mod reconciler;
pub mod record;
pub mod resolver;
pub mod server;
pub mod signature;
pub mod state;
pub mod telemetry;
pub mod webhook;

// Re-export main types
pub use authority::ZoneAuthority;
pub use client::Client;
pub use config::{ClientConfig, Config, DnsConfig, ServerConfig, TelemetryConfig};
pub use dispatch::{ChannelDispatcher, Dispatcher, HttpDispatcher};
pub use error::{DispatchErrors, DyndnsError};
pub use lookup::{AddressLookup, SystemLookup};
pub use notification::{NoopNotifier, Notifier};
pub use propagator::{MemoryZone, Propagator};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use record::{DnsRecord, UpdateRecordRequest};
pub use resolver::{AddressResolver, HttpResolver, StaticResolver};
pub use server::DyndnsServer;
pub use signature::{Keypair, SignatureKeypair, VerificationKey};
pub use state::{ConvergenceState, StateMachine, StateMachineConfig};
