//! Process lifecycle: profile, lock, service, HTTP server and exit status.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use undertow_core::config::FileConfigSource;
use undertow_core::service::{NullHost, RemoteHost};
use undertow_core::session::{SimulatedEngine, SimulationProfile, WireEngine, event_channel};
use undertow_core::tracing_setup::init_tracing;
use undertow_core::{ConfigSource, Context, InstanceLock, Profile, Service, SwarmEngine};

use crate::Cli;

/// Termination signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    fn number(self) -> u8 {
        match self {
            Signal::Interrupt => 2,
            Signal::Terminate => 15,
        }
    }
}

/// Why the daemon stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `/shutdown` was requested
    Requested,
    Signal(Signal),
}

impl ExitReason {
    /// 0 for a cooperative stop, 128 + signal number otherwise.
    pub fn code(self) -> u8 {
        match self {
            ExitReason::Requested => 0,
            ExitReason::Signal(signal) => 128 + signal.number(),
        }
    }

    pub fn exit_code(self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

fn default_profile_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".undertow"))
        .unwrap_or_else(|| PathBuf::from(".undertow"))
}

/// Runs the daemon until shutdown and reports why it stopped.
///
/// # Errors
///
/// - Profile, lock, store or bind failures during startup
pub async fn run(cli: Cli) -> anyhow::Result<ExitReason> {
    let profile = Profile::new(cli.profile.clone().unwrap_or_else(default_profile_dir));
    profile.ensure().context("Failed to prepare profile directory")?;
    init_tracing(cli.log_level.as_tracing_level(), Some(&profile.logs_dir()))
        .context("Failed to initialize logging")?;

    let lock = InstanceLock::acquire(&profile.lockfile())
        .await
        .context("Another instance holds the profile")?;

    let source: Arc<dyn ConfigSource> = Arc::new(FileConfigSource::new(profile.config_file()));
    let mut context = Context::open(profile, source)
        .await
        .context("Failed to open profile")?;
    let local = cli.local.unwrap_or(context.config.service.local_address);
    let remote = cli.remote.unwrap_or(context.config.service.remote_address);
    if cli.headless {
        context = context.with_host(Arc::new(NullHost));
    } else {
        context = context.with_host(Arc::new(RemoteHost::new(remote)));
    }

    let (events_tx, events_rx) = event_channel();
    let engine: Arc<dyn SwarmEngine> = if cli.simulate {
        tracing::warn!("Running against the simulated swarm");
        SimulatedEngine::new(SimulationProfile::default(), events_tx)
    } else {
        WireEngine::start(&context.config.network, events_tx).await
    };

    let service = Service::start(context, engine, events_rx).await;
    let listener = match undertow_web::bind(local).await {
        Ok(listener) => listener,
        Err(e) => {
            service.shutdown().await;
            return Err(e).with_context(|| format!("Failed to bind {local}"));
        }
    };
    let server = tokio::spawn(undertow_web::run_server(listener, Arc::clone(&service)));

    let shutdown = service.shutdown_token();
    let reason = tokio::select! {
        _ = shutdown.cancelled() => ExitReason::Requested,
        signal = wait_for_signal() => ExitReason::Signal(signal),
    };
    tracing::info!(?reason, "Shutting down");

    service.request_shutdown();
    match server.await {
        Ok(Err(e)) => tracing::error!("HTTP server failed: {e}"),
        Err(e) => tracing::error!("HTTP server task panicked: {e}"),
        Ok(Ok(())) => {}
    }
    service.shutdown().await;
    drop(lock);

    Ok(reason)
}

#[cfg(unix)]
async fn wait_for_signal() -> Signal {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut interrupt), Ok(mut terminate)) = (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
    else {
        tracing::warn!("Signal handlers unavailable; only /shutdown stops the daemon");
        return std::future::pending().await;
    };
    tokio::select! {
        _ = interrupt.recv() => Signal::Interrupt,
        _ = terminate.recv() => Signal::Terminate,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Signal {
    if tokio::signal::ctrl_c().await.is_err() {
        return std::future::pending().await;
    }
    Signal::Interrupt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitReason::Requested.code(), 0);
        assert_eq!(ExitReason::Signal(Signal::Interrupt).code(), 130);
        assert_eq!(ExitReason::Signal(Signal::Terminate).code(), 143);
    }
}
