use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use storage::{FileTrustStore, TrustStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use share_core::config::default_app_dir;
use share_core::target::{find_instance, resolve_host_port, sort_peers};
use share_core::{
    advertise_receiver, bind_listener, build_offer, connect, device_label, normalize_fingerprint,
    run_sender, serve_one, short_fingerprint, AcceptAll, DeviceKey, IdentityStore, ResolvedPeer,
    SessionContext, SessionEvent, ShareConfig, ShareError, Target, TrustPrompt,
};

mod artifacts;
mod prompt;

#[derive(Parser, Debug)]
#[command(
    name = "gns3util-share",
    version,
    about = "Share GNS3 cluster artifacts with a device on the local network"
)]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Application directory holding the device key, trust store and share.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List receivers advertising on the local network
    Discover {
        /// Browse window: `3`, `3s` or `250ms`
        #[arg(long, value_parser = parse_millis)]
        timeout: Option<u64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Wait for one sender and store what it sends
    Receive {
        /// Directory received artifacts are written to
        #[arg(long)]
        dest_dir: Option<PathBuf>,
    },

    /// Send artifacts to a receiver
    Send {
        /// host:port, socket address, or advertised instance name
        #[arg(long)]
        to: Option<String>,

        /// Browse window when looking the receiver up: `3`, `3s` or `250ms`
        #[arg(long, value_parser = parse_millis)]
        discover_timeout: Option<u64>,

        /// Directory the artifacts are read from
        #[arg(long)]
        src_dir: Option<PathBuf>,

        /// Send config.toml, clusterData.db and gns3key
        #[arg(long, conflicts_with_all = ["send_config", "send_db", "send_key"])]
        all: bool,

        #[arg(long)]
        send_config: bool,

        #[arg(long)]
        send_db: bool,

        #[arg(long)]
        send_key: bool,

        /// Trust a first-contact receiver without asking and send every existing artifact
        #[arg(long, short)]
        yes: bool,
    },

    /// Show this device's identity
    Identity {
        /// Replace the device key; peers must pin this device again
        #[arg(long)]
        rotate: bool,
    },

    /// Manage pinned peers
    Trust {
        #[command(subcommand)]
        cmd: TrustCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TrustCommands {
    /// List pinned peers
    List,

    /// Forget a pinned peer
    Remove {
        /// Fingerprint, with or without dashes
        fp: String,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Discover { .. } => "discover",
            Commands::Receive { .. } => "receive",
            Commands::Send { .. } => "send",
            Commands::Identity { .. } => "identity",
            Commands::Trust { .. } => "trust",
        }
    }
}

/// `250ms`, `3s` or a bare number of seconds, as milliseconds.
fn parse_millis(raw: &str) -> std::result::Result<u64, String> {
    let raw = raw.trim();
    let (digits, scale) = if let Some(ms) = raw.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(s) = raw.strip_suffix('s') {
        (s, 1000)
    } else {
        (raw, 1000)
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    if n == 0 {
        return Err("duration must be positive".into());
    }
    Ok(n.saturating_mul(scale))
}

/// A session error with the peer it happened with.
#[derive(Debug)]
struct PeerFailure {
    peer: String,
    error: ShareError,
}

impl fmt::Display for PeerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for PeerFailure {}

fn with_peer(error: ShareError, peer: Option<String>) -> anyhow::Error {
    match peer {
        Some(peer) => PeerFailure { peer, error }.into(),
        None => error.into(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let command = cli.cmd.name();
    if let Err(err) = run(cli).await {
        match err.downcast_ref::<PeerFailure>() {
            Some(failure) => eprintln!("✗ {} failed (peer {}): {:#}", command, failure.peer, err),
            None => eprintln!("✗ {} failed: {:#}", command, err),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let app_dir = cli.data_dir.unwrap_or_else(default_app_dir);
    let mut config = ShareConfig::load(&app_dir).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted");
                cancel.cancel();
            }
        });
    }

    match cli.cmd {
        Commands::Discover { timeout, json } => {
            if let Some(ms) = timeout {
                config.discover_timeout_ms = ms;
            }
            discover(&config, &cancel, json).await?;
        }

        Commands::Receive { dest_dir } => {
            if let Some(dir) = dest_dir {
                config.artifact_dir = dir;
            }
            receive(&config, cancel).await?;
        }

        Commands::Send {
            to,
            discover_timeout,
            src_dir,
            all,
            send_config,
            send_db,
            send_key,
            yes,
        } => {
            if let Some(ms) = discover_timeout {
                config.discover_timeout_ms = ms;
            }
            if let Some(dir) = src_dir {
                config.artifact_dir = dir;
            }
            let selection = artifacts::Selection {
                all,
                config: send_config,
                db: send_db,
                key: send_key,
            };
            send(&config, cancel, to.as_deref(), selection, yes).await?;
        }

        Commands::Identity { rotate } => {
            identity(&config, rotate).await?;
        }

        Commands::Trust { cmd } => {
            let store = FileTrustStore::open(&config.app_dir)
                .await
                .context("opening trust store")?;
            match cmd {
                TrustCommands::List => list_trusted(&store).await?,
                TrustCommands::Remove { fp } => {
                    let fp = normalize_fingerprint(&fp);
                    if !store.remove(&fp).await? {
                        bail!("no pinned peer with fingerprint {}", short_fingerprint(&fp));
                    }
                    println!("✓ Removed {}", short_fingerprint(&fp));
                }
            }
        }
    }

    Ok(())
}

struct Device {
    key: DeviceKey,
    label: String,
    trust: FileTrustStore,
}

async fn load_device(config: &ShareConfig) -> Result<Device> {
    let key = IdentityStore::new(config.app_dir.clone())
        .load_or_create()
        .await?;
    let trust = FileTrustStore::open(&config.app_dir)
        .await
        .context("opening trust store")?;
    Ok(Device {
        key,
        label: device_label(),
        trust,
    })
}

impl Device {
    fn session<'a>(
        &'a self,
        config: &'a ShareConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) -> SessionContext<'a> {
        SessionContext {
            key: &self.key,
            label: self.label.clone(),
            trust: &self.trust,
            config,
            events: Some(events),
            cancel,
        }
    }
}

/// Print session progress. Resolves to the peer's label once the session
/// context (and with it the sending half) is dropped.
fn spawn_progress(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    receiving: bool,
) -> JoinHandle<Option<String>> {
    tokio::spawn(async move {
        let mut peer = None;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected {
                    peer_label,
                    peer_fp,
                    remote,
                } => {
                    let arrow = if receiving { "←" } else { "→" };
                    println!(
                        "{} {} @ {} fp={}",
                        arrow,
                        peer_label,
                        remote,
                        short_fingerprint(&peer_fp)
                    );
                    peer = Some(peer_label);
                }
                SessionEvent::Verified { sas, pinned } => {
                    if pinned {
                        println!("  ✓ Known peer (SAS {})", sas);
                    } else if receiving {
                        println!("  SAS: {}", sas);
                        println!("  Confirm the sender shows the same words");
                    } else {
                        println!("  ✓ Peer pinned");
                    }
                }
                SessionEvent::OfferReceived { files, total } => {
                    println!("  Offer: {} file(s), {} bytes", files.len(), total);
                    for f in &files {
                        println!("    - {} ({} bytes)", f.name, f.size);
                    }
                }
                SessionEvent::FileCompleted { name, bytes } => {
                    println!("  ✓ {} ({} bytes)", name, bytes);
                }
                SessionEvent::Done { .. } => {}
            }
        }
        peer
    })
}

async fn discover(config: &ShareConfig, cancel: &CancellationToken, json: bool) -> Result<()> {
    let mut peers = mdns_core::browse(&config.service_type, config.discover_timeout(), cancel)
        .await
        .context("browsing the local network")?;
    sort_peers(&mut peers);

    if json {
        println!("{}", serde_json::to_string_pretty(&peers)?);
        return Ok(());
    }

    if peers.is_empty() {
        println!("No receivers found");
        return Ok(());
    }
    for p in &peers {
        let addr = p
            .socket_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| format!("{}:{}", p.host_name, p.port));
        let fp = p
            .fingerprint()
            .map(short_fingerprint)
            .unwrap_or_else(|| "-".to_string());
        println!("{} @ {} fp={}", p.instance_name, addr, fp);
        if let Some(why) = p.refusal() {
            println!("    ! not dialable: {}", why);
        }
    }
    Ok(())
}

async fn receive(config: &ShareConfig, cancel: CancellationToken) -> Result<()> {
    let device = load_device(config).await?;
    let listener = bind_listener(&device.key, SocketAddr::from(([0, 0, 0, 0], 0)))?;
    let bound = listener.local_addr()?;
    let port = bound.port();

    let announcer =
        match advertise_receiver(&config.service_type, &device.key, &device.label, bound) {
            Ok(announcer) => Some(announcer),
            Err(e) => {
                tracing::warn!("not advertised, senders must dial directly: {}", e);
                None
            }
        };

    println!("✓ Waiting for a sender as {} on UDP port {}", device.label, port);
    println!("  Fingerprint: {}", short_fingerprint(&device.key.fingerprint()));
    println!("  Destination: {}", config.artifact_dir.display());
    println!("  Press Ctrl+C to stop");

    let (tx, rx) = mpsc::unbounded_channel();
    let progress = spawn_progress(rx, true);
    let outcome = {
        let ctx = device.session(config, tx, cancel);
        serve_one(&listener, &ctx, &config.artifact_dir).await
    };
    let peer = progress.await.ok().flatten();
    if let Some(announcer) = announcer {
        announcer.stop();
    }

    match outcome {
        Ok(Some(summary)) => {
            println!(
                "✓ Received {} file(s), {} bytes from {}",
                summary.files.len(),
                summary.bytes,
                summary.peer.label
            );
            Ok(())
        }
        Ok(None) => {
            println!("No sender connected within {}s", config.idle_timeout_secs);
            Ok(())
        }
        Err(e) => Err(with_peer(e, peer)),
    }
}

async fn send(
    config: &ShareConfig,
    cancel: CancellationToken,
    to: Option<&str>,
    selection: artifacts::Selection,
    assume_yes: bool,
) -> Result<()> {
    let device = load_device(config).await?;
    let src_dir = artifacts::source_dir(&config.artifact_dir).await?;
    let files = artifacts::choose(&src_dir, selection, assume_yes).await?;
    let prepared = build_offer(&files).await?;
    println!(
        "Offering {} file(s), {} bytes from {}",
        prepared.offer.files.len(),
        prepared.offer.total,
        src_dir.display()
    );

    let peer = resolve_target(config, &cancel, to).await?;
    let conn = connect(&device.key, &peer)
        .await
        .map_err(|e| with_peer(e, Some(peer.label.clone())))?;

    let stdin_prompt = prompt::StdinPrompt;
    let accept_all = AcceptAll;
    let trust_prompt: &dyn TrustPrompt = if assume_yes {
        &accept_all
    } else {
        &stdin_prompt
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let progress = spawn_progress(rx, false);
    let outcome = {
        let ctx = device.session(config, tx, cancel);
        let result = run_sender(
            &conn,
            &ctx,
            Some(trust_prompt),
            &prepared,
            peer.expected_fp.as_deref(),
        )
        .await;
        conn.drain(Duration::from_secs(2)).await;
        result
    };
    let peer_label = progress.await.ok().flatten().unwrap_or(peer.label);

    let summary = outcome.map_err(|e| with_peer(e, Some(peer_label)))?;
    println!(
        "✓ Sent {} file(s), {} bytes to {}",
        summary.files.len(),
        summary.bytes,
        summary.peer.label
    );
    Ok(())
}

async fn resolve_target(
    config: &ShareConfig,
    cancel: &CancellationToken,
    to: Option<&str>,
) -> Result<ResolvedPeer> {
    let target = Target::parse(to);
    match target {
        Target::Addr(addr) => return Ok(ResolvedPeer::direct(addr)),
        Target::HostPort(ref host_port) => {
            return Ok(ResolvedPeer::direct(resolve_host_port(host_port).await?))
        }
        Target::Instance(_) | Target::Pick => {}
    }

    println!(
        "Looking for receivers ({:.1}s)...",
        config.discover_timeout().as_secs_f64()
    );
    let mut peers = mdns_core::browse(&config.service_type, config.discover_timeout(), cancel)
        .await
        .context("discovery failed; pass --to host:port to dial directly")?;
    sort_peers(&mut peers);

    let chosen = if let Target::Instance(name) = &target {
        find_instance(&peers, name)?.clone()
    } else {
        let mut dialable: Vec<_> = peers.into_iter().filter(|p| p.is_dialable()).collect();
        match dialable.len() {
            0 => bail!("no receivers found; run `receive` on the other device or pass --to"),
            1 => dialable.remove(0),
            _ => {
                let i = prompt::pick_peer(&dialable).await?;
                dialable.swap_remove(i)
            }
        }
    };
    Ok(ResolvedPeer::from_advertisement(&chosen)?)
}

async fn identity(config: &ShareConfig, rotate: bool) -> Result<()> {
    let store = IdentityStore::new(config.app_dir.clone());
    let key = if rotate {
        let key = store.rotate().await?;
        println!("✓ Device key rotated");
        println!("  ! Peers that pinned the old key must pin this device again");
        key
    } else {
        store.load_or_create().await?
    };

    println!("Device identity:");
    println!("  Label:       {}", device_label());
    println!("  Fingerprint: {}", short_fingerprint(&key.fingerprint()));
    println!("  Created:     {}", key.created().format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Key file:    {}", store.key_path().display());
    Ok(())
}

async fn list_trusted(store: &FileTrustStore) -> Result<()> {
    let peers = store.list().await?;
    if peers.is_empty() {
        println!("No pinned peers");
        return Ok(());
    }
    println!("Pinned peers ({}):", peers.len());
    for p in peers {
        println!("  {}  {}", short_fingerprint(&p.fp), p.label);
        println!(
            "      first seen {}, last seen {}",
            p.first_seen.format("%Y-%m-%d %H:%M"),
            p.last_seen.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_millis("100ms"), Ok(100));
        assert_eq!(parse_millis("3s"), Ok(3000));
        assert_eq!(parse_millis("2"), Ok(2000));
        assert!(parse_millis("0").is_err());
        assert!(parse_millis("soon").is_err());
    }

    #[test]
    fn send_flags_parse() {
        let cli = Cli::try_parse_from([
            "gns3util-share",
            "send",
            "--to",
            "10.0.0.5:4433",
            "--discover-timeout",
            "500ms",
            "--send-key",
            "-y",
        ])
        .unwrap();
        match cli.cmd {
            Commands::Send {
                to,
                discover_timeout,
                send_key,
                yes,
                ..
            } => {
                assert_eq!(to.as_deref(), Some("10.0.0.5:4433"));
                assert_eq!(discover_timeout, Some(500));
                assert!(send_key && yes);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn all_conflicts_with_single_artifacts() {
        assert!(Cli::try_parse_from(["gns3util-share", "send", "--all", "--send-db"]).is_err());
    }
}
