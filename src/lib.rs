use std::future::Future;

use tracing::info;

pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use config::{CliArgs, Config, ServerConfig};
pub use error::{ConnectionError, StartupError};
pub use handler::{EchoHandler, Outcome};
pub use listener::Listener;
pub use registry::Registry;

/// Serves echo connections on the configured address until `shutdown`
/// resolves, then stops gracefully.
pub async fn run_server<F>(config: &ServerConfig, shutdown: F) -> Result<(), StartupError>
where
    F: Future<Output = ()>,
{
    let mut listener = Listener::from_config(config);
    listener.start().await?;

    shutdown.await;

    info!("Starting server shutdown...");
    listener.stop().await;
    info!("Server successfully shutdown");
    Ok(())
}
