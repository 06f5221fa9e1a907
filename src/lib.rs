//! Windowgate - Distributed Sliding-Window Admission Control
//!
//! This crate decides, per client, whether a request may proceed. Counts are
//! kept in a shared counter store (Redis in production) as per-client hashes
//! of sub-window buckets, so any number of stateless service instances
//! enforce one consistent limit. Client identifiers are salted and hashed
//! before they reach the store.

pub mod admission;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
