//! Startup sequencing, the run loop, and the ordered teardown.
//!
//! Startup runs in a strict order and any failure rolls back everything
//! that already succeeded. Teardown closes the virtual interface before
//! joining the tracker: the interface read loop blocks in a kernel read
//! and closing the handle is the only way to wake it. Reversing those two
//! steps deadlocks.

use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::cloud::CloudClient;
use crate::common::cidr::Cidr;
use crate::config::StartConfig;
use crate::dns::platform::ResolverFiles;
use crate::dns::{DnsConfig, DnsResolver};
use crate::egress::EgressTunnel;
use crate::error::{Error, ProvisionError, Result};
use crate::routing::RouteManager;
use crate::session::{Session, SessionStore};
use crate::socks::SocksClient;
use crate::tracker::ConnectionTracker;
use crate::tun::TunDevice;

pub async fn run(config: StartConfig, cloud: Arc<dyn CloudClient>) -> Result<()> {
    let cidrs = config.validate()?;
    let local_ip = Cidr::parse(&config.local_ip).map_err(|e| Error::Config(e.to_string()))?;

    // 1. privileges
    ensure_root()?;

    // 2. jump host
    let instance = cloud.resolve_instance(&config.selector).await?;
    info!(
        "jump host: {} ({}, {}) in {}",
        instance.name, instance.instance_id, instance.instance_type, instance.availability_zone
    );
    if instance.state != "running" {
        return Err(Error::Config(format!(
            "instance {} is not running (state: {})",
            instance.instance_id, instance.state
        )));
    }
    if !instance.agent_connected {
        return Err(Error::Provision(ProvisionError::Unsupported(format!(
            "session agent is not connected on {}",
            instance.instance_id
        ))));
    }

    // 3. egress tunnel
    let tunnel = Arc::new(EgressTunnel::new(
        instance.clone(),
        config.ssh_user.clone(),
        config.socks_port,
        cloud.clone(),
    ));
    tunnel.start().await?;

    // 4. virtual interface
    let device = match TunDevice::create() {
        Ok(device) => Arc::new(device),
        Err(e) => {
            tunnel.stop().await;
            return Err(Error::Io(e));
        }
    };
    if let Err(e) = device.configure(&local_ip, config.mtu) {
        device.close();
        tunnel.stop().await;
        return Err(Error::Io(e));
    }
    info!(
        "virtual interface {} up at {} (mtu {})",
        device.name(),
        config.local_ip,
        config.mtu
    );

    // 5. routes, all or nothing
    let routes = RouteManager::new();
    if let Err(e) = routes.add_all(&cidrs, device.name()) {
        device.close();
        tunnel.stop().await;
        return Err(Error::Catastrophic(format!(
            "route installation failed: {}",
            e
        )));
    }
    for cidr in &cidrs {
        info!("route installed: {} -> {}", cidr, device.name());
    }

    // 6. os resolver files; failure downgrades to literal-address use
    let resolver_files = match (&config.dns_resolver, config.dns_domains.is_empty()) {
        (Some(resolver), false) => {
            let files = ResolverFiles::new(config.dns_domains.clone(), resolver);
            match files.install() {
                Ok(()) => {
                    info!("os resolver configured for {} domain(s)", config.dns_domains.len());
                    Some(files)
                }
                Err(e) => {
                    warn!("os resolver configuration failed, continuing without it: {}", e);
                    None
                }
            }
        }
        _ => None,
    };

    // 7. connection tracker
    let token = CancellationToken::new();
    let socks = Arc::new(SocksClient::new(tunnel.socks_addr()));
    let dns = config
        .dns_resolver_addr()
        .map(|addr| DnsResolver::new(DnsConfig::new(addr, config.dns_domains.clone()), socks.clone()));
    if let Some(resolver) = &dns {
        resolver.spawn_eviction(token.clone());
        info!("dns capture active, upstream {}", config.dns_resolver.as_deref().unwrap_or(""));
    }
    let tracker = ConnectionTracker::new(device.clone(), socks, dns, token.clone());
    tracker.start();

    // 8. session record
    let store = SessionStore::new();
    let session_name = config
        .session_name
        .clone()
        .unwrap_or_else(|| format!("vpctun-{}", Utc::now().timestamp()));
    let session = Session {
        name: session_name.clone(),
        instance_id: instance.instance_id.clone(),
        session_id: session_name.clone(),
        tun_device: device.name().to_string(),
        tun_ip: config.local_ip.clone(),
        prefixes: config.prefixes.clone(),
        started_at: Utc::now(),
        pid: std::process::id() as i32,
    };
    if let Err(e) = store.save(&session) {
        let failure = Error::Catastrophic(format!("failed to persist session state: {}", e));
        shutdown(
            &token, &device, &tracker, &resolver_files, &routes, &tunnel, &store, &session_name,
        )
        .await;
        return Err(failure);
    }

    // 9. signals and the run loop
    let signals = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    );
    let (mut sigint, mut sigterm) = match signals {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            let failure = Error::Catastrophic(format!("failed to install signal handlers: {}", e));
            shutdown(
                &token, &device, &tracker, &resolver_files, &routes, &tunnel, &store, &session_name,
            )
            .await;
            return Err(failure);
        }
    };

    // 10. egress health
    let (health_tx, mut health_rx) = mpsc::channel::<Error>(1);
    if config.auto_reconnect {
        tokio::spawn(monitor_tunnel(
            tunnel.clone(),
            token.clone(),
            config.clone(),
            health_tx,
        ));
    }

    info!(
        "session {} active: {} prefix(es) via {}",
        session_name,
        cidrs.len(),
        instance.instance_id
    );

    let failure = tokio::select! {
        _ = sigint.recv() => {
            info!("interrupt received, shutting down");
            None
        }
        _ = sigterm.recv() => {
            info!("terminate received, shutting down");
            None
        }
        failure = health_rx.recv() => failure,
    };

    shutdown(
        &token, &device, &tracker, &resolver_files, &routes, &tunnel, &store, &session_name,
    )
    .await;

    match failure {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// The ordered teardown. Every step runs even when earlier ones fail.
#[allow(clippy::too_many_arguments)]
async fn shutdown(
    token: &CancellationToken,
    device: &Arc<TunDevice>,
    tracker: &Arc<ConnectionTracker>,
    resolver_files: &Option<ResolverFiles>,
    routes: &RouteManager,
    tunnel: &Arc<EgressTunnel>,
    store: &SessionStore,
    session_name: &str,
) {
    token.cancel();

    // the interface goes first: it is the only thing that can wake the
    // tracker's kernel read
    device.close();
    tracker.stop().await;

    if let Some(files) = resolver_files {
        files.cleanup();
    }
    routes.cleanup();
    tunnel.stop().await;

    if let Err(e) = store.remove(session_name) {
        warn!("failed to remove session record {}: {}", session_name, e);
    }
    info!("shutdown complete");
}

fn ensure_root() -> Result<()> {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::Privilege(
            "creating the virtual interface and programming routes requires root".to_string(),
        ));
    }
    Ok(())
}

/// Periodic liveness of the egress tunnel with bounded reconnection.
/// Cancellation is re-checked right before any reconnect so a shutdown in
/// progress is never raced.
async fn monitor_tunnel(
    tunnel: Arc<EgressTunnel>,
    token: CancellationToken,
    config: StartConfig,
    health_tx: mpsc::Sender<Error>,
) {
    let mut retries: u32 = 0;
    let mut tick = tokio::time::interval(config.keep_alive());
    tick.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tick.tick() => {}
        }
        if tunnel.is_running().await {
            retries = 0;
            continue;
        }

        if config.max_retries > 0 && retries >= config.max_retries {
            error!("egress tunnel down and retry budget exhausted");
            let _ = health_tx
                .send(Error::Provision(ProvisionError::Tunnel(
                    "tunnel down and retry budget exhausted".to_string(),
                )))
                .await;
            return;
        }
        retries += 1;
        warn!("egress tunnel down, reconnecting (attempt {})", retries);
        sleep(config.reconnect_delay()).await;
        if token.is_cancelled() {
            return;
        }
        match tunnel.start().await {
            Ok(()) => {
                info!("egress tunnel reconnected");
                retries = 0;
            }
            Err(e) => error!("egress tunnel reconnect failed: {}", e),
        }
    }
}
