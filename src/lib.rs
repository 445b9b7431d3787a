//! A round-based reporting engine for oracle networks.
//!
//! A fixed set of mutually-untrusting peers agree on an off-chain observation (a price, a
//! cross-chain message, a VRF proof) and jointly produce one signed report per request, which
//! is submitted on-chain once despite message loss, peer crashes and partitions.
//!
//! ## How it works
//!
//! Each request moves through `start -> observe -> report -> sign -> transmit -> finish`. A
//! deterministic leader for every `(epoch, round)` collects observations from the followers
//! until a threshold is reached, distributes the resulting report, collects threshold-many
//! partial signatures over it and submits the report to the chain. When a round stalls, a
//! timer advances the round and leadership passes to the next peer. The epoch only moves
//! forward when the chain starts the next request generation.
//!
//! The main entry point is [`service::OracleNode`]. Chain access, observation sources, the
//! peer transport and the durable store are traits; in-memory implementations of the store,
//! event bus and transport ship with the crate.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod multisig;
pub mod peer;
pub mod protos;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod service_api;
pub mod service_stats;
pub mod service_steps;
pub mod state;
pub mod storage;
pub mod types;
pub mod utils;
