// Parser, verifier and introspection helpers are part of the reseed API but
// only tests and tooling call some of them.
#![allow(dead_code)]

mod config;
mod health;
mod http;
mod metrics;
mod netdb;
mod reseed;

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::netdb::LocalNetDb;
use crate::reseed::{Reseeder, SigningIdentity};

/// How long open HTTPS connections get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "reseeder", about = "Reseed server for signed su3 router-info bundles")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/reseeder/config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an Ed25519 signing key (PKCS#8 PEM) and its public key.
    Keygen {
        /// Signer id the key is for, e.g. `you@mail.i2p`.
        #[arg(short, long)]
        signer: String,
        /// Private key output path.  Defaults to `<signer, @ as _at_>.pem`.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub reseeder: Arc<Reseeder>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Key generation
// ---------------------------------------------------------------------------

fn run_keygen(signer: &str, out: Option<PathBuf>) -> Result<()> {
    let private_path = out.unwrap_or_else(|| PathBuf::from(config::signer_key_file(signer)));
    let mut public_path = private_path.clone().into_os_string();
    public_path.push(".pub");
    let public_path = PathBuf::from(public_path);

    let (private_pem, public_pem) = reseed::signer::generate_key_pem()?;
    write_new_file(&private_path, private_pem.as_bytes(), 0o600)?;
    write_new_file(&public_path, public_pem.as_bytes(), 0o644)?;

    tracing::info!(
        %signer,
        private_key = %private_path.display(),
        public_key = %public_path.display(),
        "signing key generated"
    );
    Ok(())
}

/// Create `path` and write `contents`, refusing to overwrite.
fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    let listen_addr: SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;
    let path = format!("{}/{}", state.config.server.prefix, http::handler::SU3_FILE_NAME);

    if let Some((cert, key)) = state.config.server.tls() {
        let tls = RustlsConfig::from_pem_file(cert, key)
            .await
            .with_context(|| {
                format!(
                    "failed to load TLS certificate {} / key {}",
                    cert.display(),
                    key.display()
                )
            })?;

        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown_signal().await;
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            }
        });

        tracing::info!(%listen_addr, %path, tls = true, "HTTP server listening");
        axum_server::bind_rustls(listen_addr, tls)
            .handle(handle)
            .serve(service)
            .await
            .context("HTTPS server error")?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, %path, tls = false, "HTTP server listening");

    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Rebuild the cache on SIGHUP.
#[cfg(unix)]
async fn run_rebuild_on_hangup(reseeder: Arc<Reseeder>) -> Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("failed to install SIGHUP handler")?;
    while hangup.recv().await.is_some() {
        tracing::info!("received SIGHUP; rebuilding bundle cache");
        if reseeder.rebuild_now().await.is_none() {
            tracing::info!("rebuild already in progress");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Some(Command::Keygen { signer, out }) = cli.command {
        return run_keygen(&signer, out);
    }

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    tracing::info!(config_path = %cli.config, signer = %config.signer.id, "starting reseeder");

    // ---- Signing key ----
    let key_path = config.signer.resolved_key_path();
    let identity = SigningIdentity::load(config.signer.id.clone(), &key_path)?;
    tracing::info!(key_path = %key_path.display(), "signing key loaded");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Descriptor source ----
    let netdb = LocalNetDb::new(config.netdb.path.clone(), config.netdb.max_age_secs);
    tracing::info!(path = %netdb.path().display(), "netDb source configured");

    // ---- Reseeder ----
    let reseeder = Arc::new(Reseeder::new(
        config.reseed_config(),
        identity,
        Arc::new(netdb),
        metrics.clone(),
    ));

    // A failed first build is not fatal: requests get 503 and the scheduler
    // retries on every tick.
    match reseeder.start().await {
        Ok(Some(summary)) => tracing::info!(
            generation = summary.generation,
            bundles = summary.bundles,
            "initial bundle cache ready"
        ),
        Ok(None) => {}
        Err(e) => tracing::error!(error = %e, "initial build failed; serving 503 until a rebuild succeeds"),
    }

    #[cfg(unix)]
    tokio::spawn({
        let reseeder = Arc::clone(&reseeder);
        async move {
            if let Err(e) = run_rebuild_on_hangup(reseeder).await {
                tracing::error!(error = %e, "SIGHUP rebuild listener failed");
            }
        }
    });

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        reseeder: Arc::clone(&reseeder),
        metrics,
    };

    // ---- Serve until shutdown ----
    let served = run_http_server(state).await;

    reseeder.shutdown().await;
    served?;

    tracing::info!("reseeder shut down cleanly");
    Ok(())
}
