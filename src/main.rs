mod tungate;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

/// Exit codes surfaced to the host process per the control-surface contract.
mod exit_code {
    pub const OK: u8 = 0;
    pub const BAD_PROFILE: u8 = 2;
    pub const PERMISSION_DENIED: u8 = 3;
    pub const PROXY_HANDSHAKE_FAILED: u8 = 4;
    pub const TUNNEL_SETUP_FAILED: u8 = 5;
    pub const GENERIC: u8 = 1;
}

#[derive(Debug, Parser)]
#[command(
    name = "tungate",
    version,
    about = "Userspace TCP/IP-over-TUN proxy gateway"
)]
struct Cli {
    /// Path to the gateway config file (.toml/.yaml/.yml). If omitted, uses TUNGATE_CONFIG; then
    /// auto-detects tungate.toml > tungate.yaml > tungate.yml from CWD; then falls back to the OS
    /// default config path.
    #[arg(long, env = "TUNGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway working directory (profile store, runtime state). Defaults to the OS per-user data
    /// dir (via directories::ProjectDirs) unless overridden.
    #[arg(long, env = "TUNGATE_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Profile id to start immediately on boot, bypassing the stored auto_connect_enabled flag.
    #[arg(long)]
    profile: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match tungate::run(cli.config, cli.workdir, cli.profile).await {
        Ok(()) => ExitCode::from(exit_code::OK),
        Err(err) => {
            eprintln!("tungate: {err:#}");
            let code = err
                .downcast_ref::<tungate::GatewayExit>()
                .map(|e| e.code())
                .unwrap_or(exit_code::GENERIC);
            ExitCode::from(code)
        }
    }
}
