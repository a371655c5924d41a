//! Overlord: a remote fleet control plane.
//!
//! A coordinator brokers long-lived connections from agents running on
//! target machines, and exposes PTY terminals, shell commands, log tails,
//! filesystem operations, bulk file transfer, and TCP port forwarding to
//! operators through a web surface. This crate provides both halves as a
//! shared library plus two binaries (`overlord-coordinator`,
//! `overlord-agent`).

pub mod agent;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod discovery;
pub mod env;
pub mod error;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod rpc;
