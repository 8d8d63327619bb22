//! Multi-source sports-betting collection & alignment engine.
//!
//! Component map (see DESIGN.md for the grounding behind each):
//! C1 `rate_limiter`, C2 `circuit_breaker`, C3 `resolver`, C4
//! `collectors`, C5 `sync`, C6 `health`, C7 `alerts`, C8 `orchestrator`,
//! C9 `staging`.

pub mod alerts;
pub mod circuit_breaker;
pub mod collectors;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod rate_limiter;
pub mod resolver;
pub mod staging;
pub mod sync;
pub mod types;

pub mod api;
