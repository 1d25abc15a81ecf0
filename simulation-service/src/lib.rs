//! Simulation session tracking and quota enforcement.
//!
//! Tracks timed exam simulation sessions against a per-user monthly quota.
//! A session consumes one unit of quota once it crosses the countable
//! threshold, at most once, enforced by conditional updates in PostgreSQL.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
