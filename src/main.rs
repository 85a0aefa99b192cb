use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "tunbridge",
    version,
    about = "tunbridge - TUN to SOCKS5 tunnel"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tunnel (default when no subcommand given)
    Run,

    /// Validate config file syntax and semantics
    Check,

    /// Generate a sample config file
    Generate {
        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Set by the SIGINT/SIGTERM handler; a watcher thread turns it into stop().
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check) => cmd_check(&cli.config),
        Some(Commands::Generate { output }) => cmd_generate(output.as_deref()),
        Some(Commands::Run) | None => cmd_run(&cli.config),
    }
}

fn cmd_run(config_path: &str) -> Result<()> {
    let config = tunbridge::config::load_config(config_path)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tunbridge starting...");
    install_signal_handlers();

    let tunnel = Arc::new(tunbridge::app::Tunnel::init(config, None)?);

    // Relay SIGINT/SIGTERM into stop(); the handler itself only flips a
    // flag. The watcher holds a weak reference so teardown is not delayed.
    let weak = Arc::downgrade(&tunnel);
    std::thread::Builder::new()
        .name("tb-signal".to_string())
        .spawn(move || loop {
            if SHUTDOWN.load(Ordering::Acquire) {
                info!("shutdown signal received");
                if let Some(tunnel) = weak.upgrade() {
                    tunnel.stop();
                }
                break;
            }
            if weak.upgrade().is_none() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        })?;

    tunnel.run()?;

    let stats = tunnel.stats();
    info!(
        rx_packets = stats.rx_packets,
        rx_bytes = stats.rx_bytes,
        tx_packets = stats.tx_packets,
        tx_bytes = stats.tx_bytes,
        "final traffic counters"
    );

    // The watcher only upgrades its weak reference momentarily; retry the
    // unwrap briefly instead of leaking the teardown.
    let mut tunnel = tunnel;
    for _ in 0..10 {
        match Arc::try_unwrap(tunnel) {
            Ok(owned) => {
                owned.fini();
                return Ok(());
            }
            Err(shared) => {
                tunnel = shared;
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }
    }
    info!("tunnel still referenced, skipping fini");
    Ok(())
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        // Broken upstream connections must surface as write errors, not kill
        // the process.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn cmd_check(config_path: &str) -> Result<()> {
    match tunbridge::config::load_config(config_path) {
        Ok(config) => {
            println!("config '{}' is valid", config_path);
            println!("  tunnel:  {} (mtu {})", config.tunnel.name, config.tunnel.mtu);
            println!(
                "  socks5:  {}:{} (udp mode: {:?})",
                config.socks5.address, config.socks5.port, config.socks5.udp
            );
            match &config.mapdns {
                Some(mapdns) => println!(
                    "  mapdns:  {} -> {}/{} ({} entries)",
                    mapdns.address,
                    mapdns.network,
                    mapdns.netmask,
                    mapdns.cache_size
                ),
                None => println!("  mapdns:  disabled"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("config '{}' has errors:", config_path);
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_generate(output: Option<&str>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, SAMPLE_CONFIG)?;
            println!("written to '{}'", path);
        }
        None => {
            print!("{}", SAMPLE_CONFIG);
        }
    }
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# tunbridge sample configuration
log:
  level: info

tunnel:
  name: tunbridge0
  ipv4: "198.18.0.1/32"
  # ipv6: "fc00::1/128"
  mtu: 8500
  # post-up: "ip rule add fwmark 438 lookup main"
  # pre-down: "ip rule del fwmark 438 lookup main"

socks5:
  address: "127.0.0.1"
  port: 1080
  # username: user
  # password: pass
  # udp: 'udp' relays datagrams over UDP ASSOCIATE, 'tcp' wraps them
  # length-prefixed on a single TCP connection.
  udp: udp

# Synthesize virtual IPv4 addresses for DNS names, so name-based flows are
# forwarded to the proxy with the hostname preserved.
mapdns:
  network: 198.19.0.0
  netmask: 255.255.0.0
  cache-size: 256
  address: 198.18.0.53
  port: 53

misc:
  max-session-count: 4096
  connect-timeout-ms: 5000
  read-write-timeout-ms: 60000
  udp-idle-timeout-ms: 30000
  # limit-nofile: 65535
"#;
