//! CartaDB peer daemon.
//!
//! Starts the RPC hub, announces itself to the shared discovery file and
//! bootstraps (or joins) the metatable. Peers then define tables and share
//! chunks with each other.
//!
//! Usage:
//!   cartadb-server --addr 127.0.0.1:7707 --discovery /tmp/cartadb-discovery.txt
//!   cartadb-server --addr 127.0.0.1:7707 --raft

use std::sync::Arc;

use tracing::{error, info};

use cartadb_core::{CartaConfig, Discovery, FileDiscovery, PeerHub, TableManager, UnlockStrategy};

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = CartaConfig {
        listen_addr: "127.0.0.1:7707".to_string(),
        ..CartaConfig::default()
    };
    let mut founder = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" | "-a" => {
                if i + 1 < args.len() {
                    config.listen_addr = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("--addr requires a host:port argument");
                    std::process::exit(1);
                }
            }
            "--discovery" | "-d" => {
                if i + 1 < args.len() {
                    config.discovery_file = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("--discovery requires a file path argument");
                    std::process::exit(1);
                }
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    config.hub_workers = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("invalid worker count: {}", args[i + 1]);
                        std::process::exit(1);
                    });
                    i += 2;
                } else {
                    eprintln!("--workers requires a number argument");
                    std::process::exit(1);
                }
            }
            "--raft" => {
                config.use_raft = true;
                i += 1;
            }
            "--founder" => {
                founder = true;
                i += 1;
            }
            "--unlock-strategy" => {
                if i + 1 < args.len() {
                    config.unlock_strategy = match args[i + 1].as_str() {
                        "reverse" => UnlockStrategy::Reverse,
                        "forward" => UnlockStrategy::Forward,
                        "random" => UnlockStrategy::Random,
                        other => {
                            eprintln!("unknown unlock strategy: {other}");
                            std::process::exit(1);
                        }
                    };
                    i += 2;
                } else {
                    eprintln!("--unlock-strategy requires reverse|forward|random");
                    std::process::exit(1);
                }
            }
            "--no-writelock-persist" => {
                config.writelock_persist = false;
                i += 1;
            }
            "--help" | "-h" => {
                println!("cartadb-server - peer daemon for the CartaDB table store");
                println!();
                println!("Usage: cartadb-server [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -a, --addr <HOST:PORT>       Listen address (default: 127.0.0.1:7707)");
                println!("  -d, --discovery <FILE>       Shared discovery file");
                println!("  -w, --workers <N>            Hub worker threads (default: 4)");
                println!("      --raft                   Use Raft chunk coordination");
                println!("      --founder                Create the metatable chunk");
                println!("      --unlock-strategy <S>    reverse | forward | random");
                println!("      --no-writelock-persist   Restart whole lock attempt on decline");
                println!("  -h, --help                   Show this help");
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    let hub = match PeerHub::bind(&config.listen_addr, config.hub_workers) {
        Ok(hub) => hub,
        Err(e) => {
            error!("failed to bind {}: {e}", config.listen_addr);
            std::process::exit(1);
        }
    };
    info!("cartadb peer listening on {}", hub.own_id());

    let discovery = Arc::new(FileDiscovery::new(
        hub.own_id().clone(),
        config.discovery_file.clone(),
    ));
    // First peer in the discovery file founds the metatable chunk.
    let create_metatable = founder
        || discovery
            .get_peers()
            .map(|peers| peers.is_empty())
            .unwrap_or(true);

    let manager = TableManager::new(Arc::clone(&hub), discovery, config);
    if let Err(e) = manager.init(create_metatable) {
        error!("bootstrap failed: {e}");
        std::process::exit(1);
    }
    info!(
        "peer ready ({})",
        if create_metatable { "founder" } else { "joiner" }
    );

    // Serve until killed; the hub workers carry all request handling.
    loop {
        std::thread::park();
    }
}
