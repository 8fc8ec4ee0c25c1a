pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod route;
pub mod server;
pub mod stream;
pub mod translate;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use logging::SharedLogger;
pub use server::{build_router, AppState};
