//! Turnstile - per-user cooldown admission gate
//!
//! This crate decides whether a user may perform an action, allowing at most
//! one permitted action per user per configured period. Decisions stay
//! correct across many stateless service instances because the only
//! synchronization point is an atomic operation in the shared store.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
