//! OAuth bridge connecting IoT scoreboard devices, an admin web UI, and the
//! upstream youth-organisation REST API.
//!
//! See each module for its own grounding; `DESIGN.md` at the workspace root
//! is the full ledger.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod models;
pub mod services;
