//! sockguard binary.
//!
//! Creates the guarded unix socket, applies its permissions and ownership,
//! wires the director to the upstream Docker socket and serves until
//! SIGINT/SIGTERM. All policy flags map one-to-one onto [`sockguard::Config`].

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nix::unistd::{Gid, Uid};
use sockguard::{Config, Director, SocketProxy, UpstreamClient};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Guarding proxy for the Docker socket: tags everything a client creates
/// with an owner label and refuses access to resources it does not own.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// The guarded socket to create
    #[arg(long, default_value = "sockguard.sock")]
    filename: PathBuf,

    /// Permissions of the guarded socket, in octal
    #[arg(long, default_value = "0600")]
    mode: String,

    /// UID (owner) of the guarded socket; defaults to the process owner
    #[arg(long)]
    uid: Option<u32>,

    /// GID (group) of the guarded socket; defaults to the process group
    #[arg(long)]
    gid: Option<u32>,

    /// Path to the real Docker socket
    #[arg(long, default_value = "/var/run/docker.sock")]
    upstream_socket: PathBuf,

    /// Value used as the owner of the socket; defaults to sockguard-pid-<pid>
    #[arg(long)]
    owner_label: Option<String>,

    /// Comma-separated path prefixes under which host binds are allowed
    #[arg(long, value_delimiter = ',')]
    allow_bind: Vec<PathBuf>,

    /// Allow containers to run with --net host
    #[arg(long)]
    allow_host_mode_networking: bool,

    /// Set CgroupParent on new containers and image builds
    #[arg(long)]
    cgroup_parent: Option<String>,

    /// Force --user on new containers
    #[arg(long)]
    user: Option<String>,

    /// Add a Docker --link from spawned containers to another container
    /// ("name" or "name:alias")
    #[arg(long)]
    docker_link: Option<String>,

    /// Always connect this container to networks created through the proxy
    /// (and disconnect it before delete)
    #[arg(long)]
    join_network: Option<String>,

    /// Network alias registered for --join-network on those connects
    #[arg(long, requires = "join_network")]
    join_network_alias: Option<String>,

    /// Log the proxy's own traffic at debug level
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "sockguard=debug,info" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .expect("default log filter");

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let mode = u32::from_str_radix(&args.mode, 8)
        .with_context(|| format!("invalid socket mode {:?}", args.mode))?;

    let owner = args
        .owner_label
        .clone()
        .filter(|owner| !owner.is_empty())
        .unwrap_or_else(|| format!("sockguard-pid-{}", std::process::id()));

    let config = Config {
        owner,
        allow_binds: args.allow_bind.clone(),
        allow_host_mode_networking: args.allow_host_mode_networking,
        cgroup_parent: args.cgroup_parent.clone(),
        user: args.user.clone(),
        docker_link: args.docker_link.clone(),
        join_network: args.join_network.clone(),
        join_network_alias: args.join_network_alias.clone(),
    };
    config.validate().context("invalid configuration")?;

    let upstream = UpstreamClient::new(&args.upstream_socket);

    // The sibling container is attached to every network created through
    // the proxy; fail early if it does not exist.
    if let Some(sibling) = config.sibling_container().context("invalid configuration")? {
        let exists = upstream
            .container_exists(&sibling)
            .await
            .context("sibling container pre-check failed")?;
        if !exists {
            bail!("sibling container '{sibling}' does not exist");
        }
        tracing::info!(container = %sibling, "sibling container will be attached to new networks");
    }

    if args.filename.exists() {
        std::fs::remove_file(&args.filename).with_context(|| {
            format!("failed to remove stale socket {}", args.filename.display())
        })?;
    }
    let listener = UnixListener::bind(&args.filename)
        .with_context(|| format!("failed to bind {}", args.filename.display()))?;

    std::fs::set_permissions(&args.filename, Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {}", args.filename.display()))?;
    if args.uid.is_some() || args.gid.is_some() {
        nix::unistd::chown(
            &args.filename,
            args.uid.map(Uid::from_raw),
            args.gid.map(Gid::from_raw),
        )
        .with_context(|| format!("failed to chown {}", args.filename.display()))?;
    }

    tracing::info!(
        socket = %args.filename.display(),
        upstream = %args.upstream_socket.display(),
        owner = %config.owner,
        mode = %format!("{mode:04o}"),
        "listening"
    );

    let proxy = Arc::new(SocketProxy::new(Director::new(config, upstream)));

    let result = tokio::select! {
        served = proxy.serve(listener) => served.context("proxy terminated"),
        () = shutdown_signal() => {
            tracing::info!("shutting down");
            Ok(())
        }
    };

    // In-flight connections run to completion in their own tasks; the
    // guarded socket itself should not outlive the process.
    let _ = std::fs::remove_file(&args.filename);
    result
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
