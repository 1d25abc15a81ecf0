//! HTTP handlers for simulation-service.

pub mod quota;
pub mod session;
pub mod webhook;
