//! Tollgate - Multi-Window Admission Control
//!
//! This crate decides whether an HTTP request may proceed given quotas over
//! calendar-aligned windows (second through year). It tracks usage per caller
//! in a shared counter store using optimistic concurrency, and produces the
//! `X-RateLimit-*`, `RateLimit-*` and `Retry-After` headers clients rely on.

pub mod config;
pub mod error;
pub mod ratelimit;
