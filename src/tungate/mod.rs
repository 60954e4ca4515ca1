pub mod admin;
pub mod app;
pub mod config;
pub mod control;
pub mod device;
pub mod gateway;
pub mod logging;
pub mod net;
pub mod profile_store;
pub mod proxy;
pub mod runtime_paths;
pub mod supervisor;
pub mod telemetry;

use std::path::PathBuf;

/// A process-exit-code-carrying error, surfaced by `main` via downcast.
///
/// Everything else propagates as a plain `anyhow::Error` (exit code 1); this type exists only
/// for the handful of outcomes the control surface's exit-code contract names explicitly.
#[derive(Debug, thiserror::Error)]
pub enum GatewayExit {
    #[error("bad profile: {0}")]
    BadProfile(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("proxy handshake failed: {0}")]
    ProxyHandshakeFailed(String),
    #[error("tunnel setup failed: {0}")]
    TunnelSetupFailed(String),
}

impl GatewayExit {
    pub fn code(&self) -> u8 {
        match self {
            GatewayExit::BadProfile(_) => 2,
            GatewayExit::PermissionDenied(_) => 3,
            GatewayExit::ProxyHandshakeFailed(_) => 4,
            GatewayExit::TunnelSetupFailed(_) => 5,
        }
    }
}

pub async fn run(
    config_path: Option<PathBuf>,
    workdir: Option<PathBuf>,
    initial_profile: Option<String>,
) -> anyhow::Result<()> {
    app::run(config_path, workdir, initial_profile).await
}
