//! vmctl Web Endpoint
//!
//! Token verification, the operation allow-list and the HTTP handler that
//! hands approved requests to the virsh executor.

pub mod auth;
pub mod config;
pub mod server;

pub use auth::{OperationPolicy, TokenVerifier};
pub use config::{Cli, ServiceConfig, Settings};
pub use server::{router, serve, AppState};
