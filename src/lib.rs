#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! fleetctl library: the dashboard and agent building blocks behind the
//! `fleetctl` binary.
//!
//! Dashboard side:
//! - `task`: task envelope, kind catalog and payloads
//! - `hub`: per-agent task channels and dispatch
//! - `streams`: terminal stream rendezvous and byte pump
//! - `tunnels`: port mapping state machine
//! - `audit`: command blacklist, session trail, recordings, retention
//! - `store`: persistence trait and the JSON-file store
//! - `auth`: user and agent token middleware
//! - `routes`: REST and WebSocket handlers
//!
//! Agent side:
//! - `agent`: task channel client, terminals, forwards, audit relay
//! - `shell`: PTY allocation and shell discovery
//!
//! Shared: `recording`, `config`, `error`, `state`.

pub mod agent;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod recording;
pub mod routes;
pub mod shell;
pub mod state;
pub mod store;
pub mod streams;
pub mod task;
pub mod tunnels;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use state::AppState;
