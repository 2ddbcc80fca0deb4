//! Drift CLI
//!
//! LAN peer-to-peer file transfer

mod config;
mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;

use drift_core::{
    LoopbackNetwork, Service, ServiceEvent, TransferSnapshot,
};
use drift_files::{ElementKind, ManifestBuilder};

use config::Config;
use progress::{format_bytes, TransferProgress};

/// Drift - LAN peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "drift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a receiving service until interrupted
    Serve {
        /// Statically announced peers, `instance-id@host:port`
        #[arg(long = "peer", value_name = "SPEC")]
        peers: Vec<String>,
    },

    /// Crawl paths and print the transfer manifest
    Manifest {
        /// Files and directories to crawl
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Include dot-prefixed entries
        #[arg(long)]
        hidden: bool,

        /// Recursion depth ceiling
        #[arg(long)]
        max_depth: Option<usize>,
    },

    /// Run an in-process sender/receiver pair and transfer the given paths
    Demo {
        /// Files and directories to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Receiving directory (temporary directory when unset)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Disable chunk compression
        #[arg(long)]
        no_compress: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration file if missing
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { peers } => run_serve(peers, &config).await,
        Commands::Manifest {
            paths,
            hidden,
            max_depth,
        } => print_manifest(paths, hidden, max_depth),
        Commands::Demo {
            paths,
            output,
            no_compress,
        } => run_demo(paths, output, no_compress, &config).await,
        Commands::Config { init } => show_config(&config, init),
    }
}

/// One service instance fed static announcements, stopped by ctrl-c
async fn run_serve(peers: Vec<String>, config: &Config) -> anyhow::Result<()> {
    let network = LoopbackNetwork::new();
    let identity = config.local_identity(format!("drift-{}", std::process::id()));
    let service = Service::new(config.service_config(), identity, network.connector());
    network.join(&service);

    // Incoming offers are accepted without prompting; everything of note
    // goes to the terminal.
    {
        let handle = tokio::runtime::Handle::current();
        let accept_target = service.clone();
        service.subscribe(Arc::new(move |event| match event {
            ServiceEvent::PeerAdded(peer) => {
                println!("Peer found: {} ({})", peer.key, peer.status);
            }
            ServiceEvent::PeerUpdated(peer) => {
                println!("Peer {}: {}", peer.key, peer.status);
            }
            ServiceEvent::PeerRemoved { peer_id } => {
                println!("Peer gone: {peer_id}");
            }
            ServiceEvent::OpenTransferUi { peer_id, transfer_id } => {
                println!("Accepting transfer {transfer_id} from {peer_id}");
                let service = accept_target.clone();
                let transfer_id = *transfer_id;
                handle.spawn(async move {
                    if let Err(error) = service.accept_transfer(transfer_id).await {
                        tracing::error!(%error, "accept failed");
                    }
                });
            }
            ServiceEvent::TransferUpdated(snapshot) if snapshot.status.is_terminal() => {
                println!("Transfer {}: {}", snapshot.id, snapshot.status);
            }
            _ => {}
        }));
    }

    for spec in &peers {
        service.on_peer_announced(&parse_peer(spec)?);
    }

    let local = service.local();
    println!(
        "{} Serving as {} (port {}, api 2)",
        style("▸").cyan(),
        local.hostname,
        local.port
    );
    println!("  Receiving into {}", config.transfer.output_dir.display());
    println!("  Press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    println!();
    service.shutdown().await;
    Ok(())
}

/// Parse an `instance-id@host:port` static peer announcement
fn parse_peer(spec: &str) -> anyhow::Result<drift_core::ServiceAnnouncement> {
    let (id, addr) = spec
        .split_once('@')
        .with_context(|| format!("peer spec missing '@': {spec}"))?;
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("peer spec missing ':port': {spec}"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("bad port in peer spec: {spec}"))?;
    Ok(drift_core::ServiceAnnouncement {
        instance_id: id.to_string(),
        port,
        ipv4: host.parse().ok(),
        ipv6: None,
        hostname: Some(host.to_string()),
        kind: Some(drift_core::SERVICE_TYPE_REAL.to_string()),
        os: None,
        api_version: Some("2".to_string()),
        auth_port: Some(port.saturating_add(1)),
    })
}

/// Crawl the inputs and print one line per manifest entry
fn print_manifest(
    paths: Vec<PathBuf>,
    hidden: bool,
    max_depth: Option<usize>,
) -> anyhow::Result<()> {
    let mut builder = ManifestBuilder::new(hidden);
    if let Some(depth) = max_depth {
        builder = builder.with_max_depth(depth);
    }
    let manifest = builder.build(&paths)?;

    println!("Root: {}", manifest.root.display());
    println!();
    for entry in &manifest.entries {
        let tag = match entry.kind {
            ElementKind::File => "file",
            ElementKind::Directory => "dir ",
            ElementKind::Symlink => "link",
        };
        println!("  {tag}  {:>10}  {}", format_bytes(entry.size), entry.relative_path);
    }
    println!();
    println!(
        "{} elements, {} total",
        manifest.element_count(),
        format_bytes(manifest.total_size())
    );
    Ok(())
}

/// Two services on a loopback network: offer, auto-accept, stream, report
async fn run_demo(
    paths: Vec<PathBuf>,
    output: Option<PathBuf>,
    no_compress: bool,
    config: &Config,
) -> anyhow::Result<()> {
    for path in &paths {
        if !path.exists() {
            anyhow::bail!("Path not found: {}", path.display());
        }
    }
    let output = match output {
        Some(dir) => dir,
        None => std::env::temp_dir().join("drift-demo"),
    };
    std::fs::create_dir_all(&output)?;

    let network = LoopbackNetwork::new();

    let mut sender_config = config.service_config();
    sender_config.transfer.compress = !no_compress;
    let sender = Service::new(
        sender_config,
        demo_identity(config, "drift-sender", 42000),
        network.connector(),
    );

    let mut receiver_config = config.service_config();
    receiver_config.transfer.compress = !no_compress;
    receiver_config.transfer.output_dir = output.clone();
    receiver_config.transfer.require_overwrite_confirmation = false;
    let receiver = Service::new(
        receiver_config,
        demo_identity(config, "drift-receiver", 43000),
        network.connector(),
    );

    network.join(&sender);
    network.join(&receiver);

    // Wait for the pair to see each other.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while sender.visible_peers().is_empty() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("peers never connected");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The receiving side accepts every offer.
    {
        let receiver = receiver.clone();
        let handle = tokio::runtime::Handle::current();
        let accept_target = receiver.clone();
        receiver.subscribe(Arc::new(move |event| {
            if let ServiceEvent::OpenTransferUi { transfer_id, .. } = event {
                let service = accept_target.clone();
                let transfer_id = *transfer_id;
                handle.spawn(async move {
                    if let Err(error) = service.accept_transfer(transfer_id).await {
                        tracing::error!(%error, "accept failed");
                    }
                });
            }
        }));
    }

    // Progress reporting off the sending side's event stream.
    let (updates_tx, mut updates) = tokio::sync::mpsc::unbounded_channel::<TransferSnapshot>();
    sender.subscribe(Arc::new(move |event| {
        if let ServiceEvent::TransferAdded(snapshot) | ServiceEvent::TransferUpdated(snapshot) =
            event
        {
            let _ = updates_tx.send(snapshot.clone());
        }
    }));

    let receiver_host = receiver.local().hostname.clone();
    sender.send_to(&receiver_host, paths)?;

    let mut bar: Option<TransferProgress> = None;
    let outcome = loop {
        let Some(snapshot) =
            tokio::time::timeout(Duration::from_secs(120), updates.recv()).await?
        else {
            anyhow::bail!("event stream closed before the transfer finished");
        };
        if bar.is_none() && snapshot.total_size > 0 {
            let label = snapshot
                .single_name
                .clone()
                .unwrap_or_else(|| format!("{} elements", snapshot.element_count));
            bar = Some(TransferProgress::new(snapshot.total_size, &label));
        }
        if let Some(bar) = &bar {
            bar.update(&snapshot);
        }
        if snapshot.status.is_terminal() {
            break snapshot;
        }
    };

    match outcome.status {
        drift_core::TransferStatus::Finished
        | drift_core::TransferStatus::FinishedWithWarnings => {
            if let Some(bar) = &bar {
                bar.finish_with_message("Transfer complete".to_string());
            }
            println!();
            println!(
                "{} Sent {} ({} elements) to {}",
                style("✓").green(),
                format_bytes(outcome.total_size),
                outcome.element_count,
                output.display()
            );
        }
        status => {
            if let Some(bar) = &bar {
                bar.abandon();
            }
            println!();
            println!("{} Transfer ended: {status}", style("✗").red());
            if let Some(error) = &outcome.error {
                println!("  {error}");
            }
        }
    }

    sender.shutdown().await;
    receiver.shutdown().await;
    Ok(())
}

fn show_config(config: &Config, init: bool) -> anyhow::Result<()> {
    let path = Config::default_path();
    if init && !path.exists() {
        config.save(&path)?;
        println!("Wrote {}", path.display());
    }
    println!("Config path: {}", path.display());
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn demo_identity(config: &Config, name: &str, port: u16) -> drift_core::LocalIdentity {
    let mut identity = config.local_identity(format!("{name}-id"));
    identity.hostname = name.to_string();
    identity.short_name = name.to_string();
    identity.display_name = name.to_string();
    identity.port = port;
    identity.auth_port = port + 1;
    identity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_spec_parses() {
        let ann = parse_peer("desk-1@192.168.1.20:42000").unwrap();
        assert_eq!(ann.instance_id, "desk-1");
        assert_eq!(ann.port, 42000);
        assert_eq!(ann.hostname.as_deref(), Some("192.168.1.20"));
        assert!(ann.ipv4.is_some());
        assert_eq!(ann.auth_port, Some(42001));
        assert!(ann.is_real());
    }

    #[test]
    fn peer_spec_hostname_form() {
        let ann = parse_peer("desk-2@workbench:42000").unwrap();
        assert!(ann.ipv4.is_none());
        assert_eq!(ann.hostname.as_deref(), Some("workbench"));
    }

    #[test]
    fn malformed_peer_specs_rejected() {
        assert!(parse_peer("no-address").is_err());
        assert!(parse_peer("id@host-only").is_err());
        assert!(parse_peer("id@host:notaport").is_err());
    }
}
