pub mod api;
pub mod output;

pub use api::{ApiServer, ApiServerConfig};
