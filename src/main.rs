use clap::{Parser, Subcommand};
use nat64d::config;
use nat64d::control;
use nat64d::dataplane::{L4Proto, Nat64};
use nat64d::telemetry::{init_logging, LogConfig, MetricsRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "nat64d")]
#[command(about = "A userspace stateful NAT64 translator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the translator daemon
    Run {
        /// Path to nat64d.toml
        #[arg(short, long, default_value = "nat64d.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate nat64d.toml without starting the daemon
    Validate {
        /// Path to nat64d.toml
        #[arg(short, long, default_value = "nat64d.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { action }) => match action {
            ConfigAction::Validate {
                config: config_path,
            } => {
                init_logging(None);
                if let Err(e) = cmd_config_validate(&config_path) {
                    eprintln!("[ERROR] {}", e);
                    std::process::exit(1);
                }
            }
        },
        Some(Commands::Run { config }) => {
            if let Err(e) = cmd_run(&config) {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
        None => {
            if let Err(e) = cmd_run(&PathBuf::from("nat64d.toml")) {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}

fn cmd_run(config_path: &PathBuf) -> Result<(), String> {
    let cfg = match config::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            // A missing file is fine; everything has defaults.
            eprintln!(
                "[WARN] Could not load {} ({}); using defaults",
                config_path.display(),
                e
            );
            config::Config::default()
        }
    };

    init_logging(Some(&LogConfig {
        level: cfg.logging.level.clone(),
        format: cfg.logging.format.clone(),
    }));

    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }

    let runtime = cfg
        .to_runtime()
        .map_err(|e| format!("Bad configuration: {}", e))?;

    let metrics = Arc::new(MetricsRegistry::new());
    let engine = Arc::new(Nat64::new(runtime, metrics));

    seed_engine(&engine, &cfg)?;

    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;
    rt.block_on(run_daemon(engine, cfg))
}

/// Loads the pools and static mappings from the startup file.
fn seed_engine(engine: &Arc<Nat64>, cfg: &config::Config) -> Result<(), String> {
    for prefix in &cfg.pool6.prefixes {
        let prefix = config::parse_prefix6(prefix).map_err(|e| e.to_string())?;
        engine.pool6_add(prefix).map_err(|e| e.to_string())?;
    }
    for addr in &cfg.pool4.addresses {
        let addr = addr
            .parse()
            .map_err(|_| format!("'{}' is not an IPv4 address", addr))?;
        engine.pool4_add(addr).map_err(|e| e.to_string())?;
    }
    for entry in &cfg.bib_entries {
        let l4 = match entry.protocol.as_str() {
            "tcp" => L4Proto::Tcp,
            "udp" => L4Proto::Udp,
            _ => L4Proto::Icmp,
        };
        let addr6 = config::parse_taddr6(&entry.ipv6).map_err(|e| e.to_string())?;
        let addr4 = config::parse_taddr4(&entry.ipv4).map_err(|e| e.to_string())?;
        engine
            .bib_add_static(addr6, addr4, l4)
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

async fn run_daemon(engine: Arc<Nat64>, cfg: config::Config) -> Result<(), String> {
    let socket_path = cfg.control.socket.clone();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| format!("Failed to bind control socket {}: {}", socket_path, e))?;
    info!("control socket listening on {}", socket_path);

    // The packet hook is wired up by the embedder; this process hosts the
    // control plane and the session expirer.
    info!("nat64d started; waiting for control requests");

    let expirer_engine = engine.clone();
    let mut expiry_timer = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = expiry_timer.tick() => {
                let outputs = expirer_engine.expire_sessions();
                for packet in &outputs {
                    // Without an attached packet hook there is nowhere to
                    // route these; the embedder's expiry loop sends them.
                    debug!(family = ?packet.family, len = packet.bytes.len(),
                        "expiry produced a packet with no hook attached");
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(engine, stream).await {
                                warn!("control client error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("control accept error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = std::fs::remove_file(&socket_path);
                return Ok(());
            }
        }
    }
}

/// One control connection: length-framed requests in, responses out.
async fn serve_client(engine: Arc<Nat64>, mut stream: UnixStream) -> std::io::Result<()> {
    loop {
        let mut length_bytes = [0u8; 4];
        match stream.read_exact(&mut length_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let length = u32::from_le_bytes(length_bytes) as usize;
        if length < control::HEADER_LEN || length > 1 << 20 {
            warn!("control request with bogus length {}", length);
            return Ok(());
        }

        let mut request = vec![0u8; length];
        request[..4].copy_from_slice(&length_bytes);
        stream.read_exact(&mut request[4..]).await?;

        let response = control::handle_request(&engine, &request);
        stream.write_all(&response).await?;
    }
}
