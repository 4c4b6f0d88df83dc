//! Ratewarden - Distributed Rate Limiting Engine
//!
//! This crate enforces request quotas shared by any number of processes.
//! Every decision is a single atomic program evaluated inside a shared store
//! (Redis in production, an in-process store for tests), so concurrent
//! callers can never overshoot a limit. On top of the engine sit a batch
//! processor, a per-key façade and an HTTP middleware that fails open.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
