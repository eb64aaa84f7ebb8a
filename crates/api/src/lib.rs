//! HTTP API: routing, middleware, and request/response mapping for the
//! provisioning service.

pub mod app;
pub mod middleware;
