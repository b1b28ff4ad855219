pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod stages;
pub mod store;

pub use config::{AppConfig, ServerConfig};
pub use error::{PortdError, PortdResult};
pub use model::*;
pub use pipeline::Pipeline;
pub use registry::Registry;
