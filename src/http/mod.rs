//! HTTP layer for the reseed service.
//!
//! An axum server that hands out signed su3 bundles from the in-memory
//! cache, plus health and metrics endpoints.  TLS is terminated in front of
//! this server.

pub mod handler;
