//! HTTP API Module
//!
//! Provides a REST API for cluster statistics, membership and backups.

mod http;

pub use http::{ErrorResponse, HealthResponse, HttpServer, JoinRequest, OkResponse, SnapshotResponse};
