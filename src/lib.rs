//! Turnstile - Brute-force Protection for HTTP APIs
//!
//! This crate implements per-client rate limiting with lockout for HTTP
//! services. Authentication endpoints get a strict budget and a timed
//! lockout once it is exhausted; other API routes get a looser one.
//! Counters live in Redis when several instances share a backend, or in
//! process memory otherwise. Any failure in the limiter lets the request
//! through.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
