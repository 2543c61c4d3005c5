#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use xferfs_fuse::{
    BridgeConfig, BridgeFs, FileConfig, GatewayKind, MountConfig, MutationPolicy, XferFs,
    mount_background,
};
use xferfs_gateway::globus::{DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT};
use xferfs_gateway::{DirectoryGateway, GatewayError, GlobusGateway, TransferGateway};

/// Mount a remote transfer endpoint as a local filesystem
#[derive(Parser)]
#[command(name = "xferfs")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Mount a Globus endpoint, staging downloads through a local endpoint
    XFERFS_GLOBUS_TOKEN=... xferfs mount /mnt/remote --remote esnet#dtn --local-endpoint me#laptop

    # Mount a directory-backed endpoint (no network)
    xferfs mount /mnt/data --remote data --gateway directory \\
        --endpoint-root data=/srv/data --endpoint-root local=/ --local-endpoint local
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a remote endpoint and serve it until interrupted
    Mount(MountArgs),
}

#[derive(Args)]
struct MountArgs {
    /// Directory to mount on
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Remote endpoint to expose (falls back to the config file)
    #[arg(long = "remote", short = 'r', env = "XFERFS_REMOTE_ENDPOINT")]
    remote_endpoint: Option<String>,

    /// Endpoint that can write into the local cache directory
    #[arg(long, env = "XFERFS_LOCAL_ENDPOINT")]
    local_endpoint: Option<String>,

    /// Local scratch directory for downloaded content (recreated on mount)
    #[arg(long, env = "XFERFS_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Gateway implementation
    #[arg(long, value_enum)]
    gateway: Option<GatewayKind>,

    /// Directory-gateway endpoint root, as NAME=DIR (repeatable)
    #[arg(long = "endpoint-root", value_name = "NAME=DIR", value_parser = parse_endpoint_root)]
    endpoint_roots: Vec<(String, PathBuf)>,

    /// Globus Transfer access token
    #[arg(long, env = "XFERFS_GLOBUS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Make unlink/rmdir/rename wait up to this long for the remote side
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    wait_for_remote: Option<Duration>,

    /// Do not upload modified files when they are closed
    #[arg(long)]
    no_write_back: bool,

    /// Unmount automatically if the process exits
    #[arg(long)]
    auto_unmount: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, env = "XFERFS_CONFIG")]
    config: Option<PathBuf>,
}

fn parse_endpoint_root(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, dir)) if !name.is_empty() && !dir.is_empty() => {
            Ok((name.to_string(), PathBuf::from(dir)))
        }
        _ => Err(format!("expected NAME=DIR, got '{raw}'")),
    }
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match cli.command {
        Commands::Mount(args) => mount(args),
    }
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

fn load_file_config(args: &MountArgs) -> Result<FileConfig> {
    match &args.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("Failed to load config file {}", path.display())),
        None => FileConfig::load_default().context("Failed to load config file"),
    }
}

fn build_gateway(args: &MountArgs, file: &FileConfig) -> Result<Arc<dyn TransferGateway>> {
    match args.gateway.or(file.gateway).unwrap_or_default() {
        GatewayKind::Globus => {
            let Some(token) = args.token.clone() else {
                bail!("A Globus access token is required (set XFERFS_GLOBUS_TOKEN or pass --token)");
            };
            let base_url = file.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
            let gateway = GlobusGateway::with_base_url(
                base_url,
                SecretString::from(token),
                DEFAULT_REQUEST_TIMEOUT,
            )
            .context("Failed to create Globus client")?;
            Ok(Arc::new(gateway))
        }
        GatewayKind::Directory => {
            let mut roots: BTreeMap<String, PathBuf> = file.endpoint_roots.clone();
            roots.extend(args.endpoint_roots.iter().cloned());
            if roots.is_empty() {
                bail!("The directory gateway needs at least one --endpoint-root NAME=DIR");
            }
            let gateway = roots
                .into_iter()
                .fold(DirectoryGateway::new(), |gw, (name, dir)| gw.with_endpoint(name, dir));
            Ok(Arc::new(gateway))
        }
    }
}

fn activate(gateway: &dyn TransferGateway, endpoint: &str) -> Result<()> {
    let status = gateway
        .activate_endpoint(endpoint)
        .with_context(|| format!("Failed to activate endpoint {endpoint}"))?;
    if !status.is_ok() {
        return Err(GatewayError::Activation {
            endpoint: endpoint.to_string(),
            code: status.code,
            message: status.message,
        }
        .into());
    }
    tracing::info!(endpoint, "Endpoint activated");
    Ok(())
}

fn mount(args: MountArgs) -> Result<()> {
    let file = load_file_config(&args)?;
    let Some(local_endpoint) = args
        .local_endpoint
        .clone()
        .or_else(|| file.local_endpoint.clone())
    else {
        bail!("No local endpoint given (use --local-endpoint or set local_endpoint in the config)");
    };
    let Some(remote_endpoint) = args
        .remote_endpoint
        .clone()
        .or_else(|| file.remote_endpoint.clone())
    else {
        bail!("No remote endpoint given (use --remote or set remote_endpoint in the config)");
    };

    let gateway = build_gateway(&args, &file)?;
    activate(gateway.as_ref(), &local_endpoint)?;
    activate(gateway.as_ref(), &remote_endpoint)?;

    let mut config = BridgeConfig::new(&remote_endpoint, &local_endpoint).apply_file(&file);
    if let Some(dir) = &args.cache_dir {
        config = config.cache_dir(dir);
    }
    if let Some(timeout) = args.wait_for_remote {
        config = config.mutation_policy(MutationPolicy::WaitForRemote { timeout });
    }
    if args.no_write_back {
        config = config.write_back(false);
    }

    let bridge = Arc::new(
        BridgeFs::new(gateway, config).context("Failed to initialise the filesystem bridge")?,
    );
    let mount_config = MountConfig::new(&remote_endpoint).auto_unmount(args.auto_unmount);
    let handle = mount_background(XferFs::new(Arc::clone(&bridge)), &args.mountpoint, &mount_config)
        .context("Failed to mount")?;

    eprintln!("Mounted {remote_endpoint} at {}", args.mountpoint.display());
    eprintln!("Press Ctrl-C to unmount");

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;
    let _ = rx.recv();

    eprintln!("\nUnmounting (waiting for pending remote changes)...");
    handle.unmount();
    bridge.destroy();
    Ok(())
}
