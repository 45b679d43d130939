//! HTTP layer of the permission service.
//!
//! This module provides the axum-based HTTP server that answers repository
//! read-permission queries, accepts operator cache invalidations, and
//! exposes health and metrics endpoints.

pub mod handler;
