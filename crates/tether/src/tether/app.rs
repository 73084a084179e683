use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::tether::{admin, config, logging, net, telemetry, tunnel};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    if cfg.server.is_none() && cfg.client.is_none() {
        anyhow::bail!("config: nothing to run (set [server] and/or [client])");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server_enabled = cfg.server.is_some(),
        client_enabled = cfg.client.is_some(),
        admin_addr = %cfg.admin_addr,
        "tether: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // Tunnel server.
    let mut server_state = None;
    if let Some(sc) = &cfg.server {
        let server = tunnel::server::Server::new(tunnel::server::ServerOptions {
            listen_addr: sc.listen_addr.clone(),
            auth_token: sc.auth_token.clone(),
            secret: sc.secret.clone(),
            key: sc.key.clone(),
            judge_delay: sc.judge_delay,
            heartbeat_delay: sc.heartbeat_delay,
            unbound_ttl: sc.unbound_ttl,
            allow_host_override: sc.allow_host_override,
            default_bind_host: sc.default_bind_host.clone(),
            close_on_auth_failure: sc.close_on_auth_failure,
        })?;
        server_state = Some(server.state());

        // Bind up front so a taken port fails startup instead of a background task.
        let ln = server.listen().await?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.serve(ln, shutdown).await });
    }

    // Tunnel client.
    let mut client_state = None;
    if let Some(cc) = &cfg.client {
        let client = tunnel::client::Client::new(tunnel::client::ClientOptions {
            server_addr: cc.server_addr.clone(),
            auth_token: cc.auth_token.clone(),
            min_reconnect_delay: cc.min_reconnect_delay,
            max_reconnect_delay: cc.max_reconnect_delay,
            heartbeat_delay: cc.heartbeat_delay,
            dial_timeout: cc.dial_timeout,
            proxy: cc.proxy.as_ref().map(|p| tunnel::client::ProxyOptions {
                name: p.name.clone(),
                local_addr: p.local_addr.clone(),
                remote_host: p.remote_host.clone(),
                remote_port: p.remote_port,
                secret: p.secret.clone(),
                key: p.key.clone(),
                data_host: p.data_host.clone(),
            }),
        })?;
        client_state = Some(client.subscribe());

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let ln = TcpListener::bind(admin_addr.as_ref())
            .await
            .with_context(|| format!("admin: listen {admin_addr}"))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            config_path: resolved.path.clone(),
            server: server_state,
            client: client_state,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(ln, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
