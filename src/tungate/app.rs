use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::tungate::{
    admin, config, control, logging, profile_store, runtime_paths, supervisor, telemetry,
};

pub async fn run(
    config_path: Option<PathBuf>,
    workdir: Option<PathBuf>,
    initial_profile: Option<String>,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let paths = runtime_paths::resolve_runtime_paths(workdir)?;
    let profile_store = Arc::new(profile_store::ProfileStore::open(&paths.profiles_path)?);

    let prom = Arc::new(telemetry::init_prometheus()?);

    tracing::info!(
        config = %resolved.path.display(),
        workdir = %paths.workdir.display(),
        admin_addr = %cfg.admin_addr,
        "tungate: starting"
    );

    let (command_tx, command_rx) = control::command_channel();
    let (status_tx, status_rx) = tokio::sync::watch::channel(control::StatusEvent::idle());

    let sup = supervisor::Supervisor::new(cfg.clone(), profile_store.clone(), status_tx);

    let mut tasks = JoinSet::new();

    {
        let sup = sup.clone();
        tasks.spawn(async move {
            sup.run_command_loop(command_rx).await;
            Ok(())
        });
    }

    if !cfg.admin_addr.trim().is_empty() {
        let addr: SocketAddr = cfg
            .admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom,
            profile_store: profile_store.clone(),
            commands: command_tx.clone(),
            status: status_rx,
        };
        tasks.spawn(async move { admin::serve(addr, state).await });
    }

    let boot_profile = initial_profile
        .or_else(|| {
            if profile_store.auto_connect_enabled() && !profile_store.manually_disconnected() {
                profile_store
                    .last_connected_profile_id()
                    .or_else(|| profile_store.selected_profile_id())
            } else {
                None
            }
        });

    if let Some(profile_id) = boot_profile {
        if let Err(err) = sup.clone().start(profile_id.clone()).await {
            tracing::warn!(profile_id = %profile_id, error = %err, "tungate: boot-time session start failed");
        }
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let _ = sup.stop(true).await;

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
