//! `wharfd`: the HTTP agent that runs on every fleet host and reconciles
//! the installed archive against the diffs and full uploads `wharf`
//! sends it (spec.md §4.3, §6). One process per application host; one
//! `Reconciler` per process, guarding the installed archive with a
//! single-flight lock.
//!
//! Bootstrap follows the pack's axum server idiom: `tracing_subscriber`
//! registry with an `EnvFilter`, a `TraceLayer` over the whole router,
//! and a plain `tokio::net::TcpListener` + `axum::serve`. No TLS
//! termination here; the agent is expected to sit behind the same
//! balancer fleet it reports into, consistent with spec.md's non-goal of
//! agent-side TLS termination.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use wharf_core::reconciler::Reconciler;
use wharf_core::routes::{self, AgentState};
use wharf_core::status::StatusTracker;

/// Chunked and full-archive uploads can legitimately carry a large WAR;
/// cap the request body well above any expected archive rather than
/// leaving axum's 2 MiB default in place (spec.md §4.8).
const MAX_UPLOAD_BODY_BYTES: usize = 500 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "wharfd")]
#[command(about = "Agent that reconciles an application host's installed archive")]
struct Args {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "WHARFD_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the HTTP listener to.
    #[arg(long, env = "WHARFD_PORT", default_value_t = 7070)]
    port: u16,

    /// Path to the installed archive this agent reconciles.
    #[arg(long, env = "WHARFD_INSTALLED_ARCHIVE")]
    installed_archive: PathBuf,

    /// Scratch directory used to extract, modify, and repackage the
    /// archive during reconciliation.
    #[arg(long, env = "WHARFD_SCRATCH_DIR")]
    scratch_dir: PathBuf,

    /// Reported in `/health` and version-compatibility checks.
    #[arg(long, env = "WHARFD_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    agent_version: String,

    /// Plugin identity reported by `/plugins/versions`, if this agent
    /// fronts a specific application-server plugin rather than a bare
    /// archive drop.
    #[arg(long, env = "WHARFD_PLUGIN_VERSION")]
    plugin_version: Option<String>,

    /// Hostname reported to balancer-mapping consumers; defaults to the
    /// OS hostname when unset.
    #[arg(long, env = "WHARFD_DOMAIN_NAME")]
    domain_name: Option<String>,

    /// Command run to trigger the application server's own redeploy hook
    /// after the archive is repackaged. Without one configured, redeploy
    /// is a no-op (useful for servers that reload on file-change).
    #[arg(long, env = "WHARFD_REDEPLOY_COMMAND")]
    redeploy_command: Option<String>,

    /// Arguments passed to `--redeploy-command`.
    #[arg(long, env = "WHARFD_REDEPLOY_ARG")]
    redeploy_arg: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wharf_agent=info,wharf_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        installed_archive = %args.installed_archive.display(),
        scratch_dir = %args.scratch_dir.display(),
        "starting wharfd"
    );

    let status = StatusTracker::new();
    let mut reconciler = Reconciler::new(args.installed_archive, args.scratch_dir, status);
    if let Some(program) = args.redeploy_command {
        reconciler = reconciler.with_redeploy_command(program, args.redeploy_arg);
    }

    let mut state = AgentState::new(Arc::new(reconciler), args.agent_version);
    state.plugin_version = args.plugin_version;
    state.domain_name = args.domain_name.or_else(|| gethostname());

    let app = routes::router(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {}:{} ({e})", args.host, args.port))?;

    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn gethostname() -> Option<String> {
    Some(gethostname::gethostname().to_string_lossy().to_string())
}
