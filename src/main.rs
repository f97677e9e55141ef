//! ovpn-bridge CLI: loopback self-test and profile normalization.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ovpn_bridge::engine::{LoopbackBuilder, LoopbackOptions};
use ovpn_bridge::{config, logging, Session, SessionConfig, SessionRegistry};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ovpn-bridge")]
#[command(about = "Multi-tunnel OpenVPN bridge tools")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Session configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run tunnels on the loopback engine: connect, echo packets, disconnect
    Selftest {
        /// Number of tunnels to run side by side
        #[arg(short, long, default_value_t = 2)]
        tunnels: usize,

        /// Packets to echo per tunnel
        #[arg(short, long, default_value_t = 8)]
        packets: usize,
    },
    /// Print a profile as the engine would receive it (secrets redacted)
    Normalize {
        /// Path to the .ovpn profile
        profile: PathBuf,
    },
}

const SELFTEST_PROFILE: &str = "client\ndev tun\nremote 127.0.0.1 1194 udp\nverb 3\n";

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let session_config = match &cli.config {
        Some(path) => SessionConfig::load_json(path)?,
        None => {
            let default = Path::new(ovpn_bridge::DEFAULT_CONFIG_FILE);
            if default.exists() {
                SessionConfig::load_json(default)?
            } else {
                SessionConfig::default()
            }
        }
    };

    match cli.command {
        Command::Selftest { tunnels, packets } => selftest(session_config, tunnels, packets),
        Command::Normalize { profile } => normalize(&session_config, &profile),
    }
}

fn normalize(session_config: &SessionConfig, path: &Path) -> Result<()> {
    let profile = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile: {}", path.display()))?;
    let out = config::normalize_profile(&profile, session_config);
    print!("{}", logging::redact_profile(&out));
    Ok(())
}

fn selftest(session_config: SessionConfig, tunnels: usize, packets: usize) -> Result<()> {
    if tunnels == 0 {
        bail!("need at least one tunnel");
    }
    info!(version = ovpn_bridge::VERSION, tunnels, packets, "Self-test starting");

    let builder = LoopbackBuilder::new(LoopbackOptions::default());
    let stats = builder.stats();
    let registry = SessionRegistry::new();

    for i in 0..tunnels {
        let id = format!("selftest-{i}");
        let session = Session::create(&id, &builder, None, None, session_config.clone())?;
        registry.insert(session.clone())?;
        session.connect(SELFTEST_PROFILE, "selftest", "selftest")?;
    }

    for id in registry.ids() {
        let session = registry.get(&id).context("session vanished")?;
        wait_until(Duration::from_secs(5), || session.is_connected())
            .with_context(|| format!("{id} did not connect: {}", session.last_error()))?;
        echo_packets(&session, packets).with_context(|| format!("{id} echo failed"))?;
        info!(tunnel = %id, snapshot = ?session.snapshot().ipv4, "Tunnel verified");
    }

    let reconnected = registry.reconnect_all();
    if reconnected != tunnels {
        warn!(reconnected, tunnels, "Not every tunnel reconnected");
    }

    registry.shutdown();
    info!(
        packets = stats.packets(),
        bytes = stats.bytes(),
        echoed = stats.echoed(),
        "Self-test passed"
    );
    Ok(())
}

/// Write `count` fake IPv4 packets to the application end and read each echo back.
fn echo_packets(session: &Arc<Session>, count: usize) -> Result<()> {
    let app = session
        .adapter()
        .context("no adapter")?
        .app_end()
        .context("no application end")?;
    let mut buf = vec![0u8; 2048];

    for n in 0..count {
        let mut packet = vec![0x45u8; 20 + n];
        packet[1] = n as u8;
        app.send(&packet)?;
        let len = app.recv(&mut buf)?;
        if buf[..len] != packet[..] {
            error!(tunnel = %session.id(), n, len, "Echo mismatch");
            bail!("echo mismatch on packet {n}");
        }
    }
    Ok(())
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    bail!("timed out after {timeout:?}")
}
