//! HTTP gateway exposing a shared client

pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig};
