//! OpenV sandbox service library
//!
//! Ephemeral per-project sandbox containers, the reconciler that keeps them in
//! line with the session records, and the terminal bridge into a running
//! sandbox.

pub mod api;
pub mod auth;
pub mod db;
pub mod sandbox;
pub mod session;
pub mod terminal;
