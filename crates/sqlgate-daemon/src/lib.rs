//! HTTP surface for the sqlgate SQL pipeline: routing, API-key permission
//! checks, IP allow-listing and telemetry bootstrap.

pub mod auth;
pub mod middleware;
pub mod server;
pub mod telemetry;
