//! reportdesk-core: client-side real-time reconciliation for the complaint
//! dashboard.
//!
//! Merges push events, interval polls and optimistic local mutations into one
//! consistent view per complaint and chat thread, guards status transitions,
//! and keeps the session lease alive.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod poll;
pub mod reconcile;
pub mod session;
pub mod sim;
pub mod token;
pub mod transport;
pub mod types;
