//! tapra
//!
//! Router advertisement responder for VM tap interfaces. Subscribes to link
//! notifications, adopts the taps that already exist, then follows link
//! changes until SIGINT or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tapra_agent::config::{Config, LogFormat};
use tapra_agent::netlink::{LinkSubscription, Netlink};
use tapra_agent::socket::Icmpv6Transport;
use tapra_agent::{Driver, DriverExit, Engine};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long sessions get to wind down on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const LINK_EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("invalid configuration")?;
    init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "starting tapra");
    info!(
        pattern = %config.pattern,
        lifetime = ?config.advert.router_lifetime,
        interval = ?config.advert.interval,
        excluded = config.exclusions.blocks().len(),
        "configuration loaded"
    );

    if config.lifetime_too_short() {
        warn!(
            lifetime = ?config.advert.router_lifetime,
            interval = ?config.advert.interval,
            "lifetime should be at least 3 times the interval"
        );
    }

    // Subscribe before listing so no link change falls between the two.
    let (events_tx, mut events_rx) = mpsc::channel(LINK_EVENT_BUFFER);
    let subscription = LinkSubscription::start(events_tx).context("unable to open netlink feed")?;

    let netlink = Netlink::new();
    let links = tokio::task::spawn_blocking(move || netlink.links())
        .await
        .context("link listing task failed")?
        .context("unable to get current list of links")?;

    let engine = Engine::new(
        Arc::new(netlink),
        Arc::new(Icmpv6Transport::new()),
        config.exclusions.clone(),
        config.advert,
    );
    let driver = Driver::new(engine, config.pattern.clone());

    let adopted = driver.adopt_existing(&links);
    info!(links = links.len(), adopted, "startup enumeration complete");

    let exit = driver.run(&mut events_rx, shutdown_signal()).await;

    // Closing the receiver unblocks a reader thread stuck on a full channel.
    drop(events_rx);
    let _ = tokio::task::spawn_blocking(move || drop(subscription)).await;

    driver.engine().shutdown(SHUTDOWN_TIMEOUT).await;

    match exit {
        DriverExit::Shutdown => {
            info!("shutdown complete");
            Ok(())
        }
        DriverExit::FeedEnded => bail!("netlink feed ended"),
    }
}

fn init_tracing(config: &Config) {
    let Some(directive) = config.log_level.directive() else {
        return;
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| directive.into());

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
    }
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }

    info!("received shutdown signal");
}
