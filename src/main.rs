//! TQCache - A Persistent Memcached-Compatible Key-Value Cache
//!
//! This is the main entry point for the TQCache server. It parses
//! memcached-compatible flags (plus TQCache-specific ones and an
//! optional INI file), opens the cache engine, and accepts text/binary
//! protocol clients over TCP or a Unix socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal;
use tqcache::commands::CommandHandler;
use tqcache::config::{parse_duration, parse_sync_mode, FileConfig};
use tqcache::connection::{handle_connection, ConnectionStats};
use tqcache::storage::{Cache, CacheConfig};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration assembled from defaults, config file and flags.
struct Config {
    /// TCP `host:port`, or a Unix socket path when it starts with `/`.
    listen: String,
    /// Admission limit on simultaneous connections.
    max_connections: u64,
    cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", tqcache::DEFAULT_PORT),
            max_connections: 1024, // memcached default
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments (and `--config`).
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let mut config_file: Option<PathBuf> = None;
        let mut port: Option<u16> = None;
        let mut listen_host: Option<String> = None;
        let mut socket_path: Option<String> = None;
        let mut max_connections: Option<u64> = None;
        let mut shards: Option<usize> = None;
        let mut data_dir: Option<PathBuf> = None;
        let mut default_ttl: Option<Duration> = None;
        let mut max_ttl: Option<Duration> = None;
        let mut sync_mode = None;
        let mut sync_interval: Option<Duration> = None;
        let mut mailbox_capacity: Option<usize> = None;

        fn take_value(args: &[String], i: usize, name: &str) -> String {
            if i + 1 < args.len() {
                args[i + 1].clone()
            } else {
                eprintln!("Error: {} requires a value", name);
                std::process::exit(1);
            }
        }

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "-p" | "--port" => {
                    port = Some(take_value(&args, i, flag).parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    }));
                    i += 2;
                }
                "-l" | "--listen" => {
                    listen_host = Some(take_value(&args, i, flag));
                    i += 2;
                }
                "-s" | "--socket" => {
                    socket_path = Some(take_value(&args, i, flag));
                    i += 2;
                }
                "-c" | "--connections" => {
                    max_connections = parse_or_die(&take_value(&args, i, flag), "connection limit");
                    i += 2;
                }
                "-t" | "--threads" | "--shards" => {
                    shards = parse_or_die(&take_value(&args, i, flag), "shard count");
                    i += 2;
                }
                "--config" => {
                    config_file = Some(PathBuf::from(take_value(&args, i, flag)));
                    i += 2;
                }
                "--data-dir" => {
                    data_dir = Some(PathBuf::from(take_value(&args, i, flag)));
                    i += 2;
                }
                "--default-ttl" => {
                    default_ttl = Some(duration_or_die(&take_value(&args, i, flag), "default TTL"));
                    i += 2;
                }
                "--max-ttl" => {
                    max_ttl = Some(duration_or_die(&take_value(&args, i, flag), "max TTL"));
                    i += 2;
                }
                "--sync-mode" => {
                    let value = take_value(&args, i, flag);
                    sync_mode = Some(parse_sync_mode(&value).unwrap_or_else(|_| {
                        eprintln!(
                            "Error: invalid sync-mode: {} (valid: none, periodic, always)",
                            value
                        );
                        std::process::exit(1);
                    }));
                    i += 2;
                }
                "--sync-interval" => {
                    sync_interval = Some(duration_or_die(&take_value(&args, i, flag), "sync interval"));
                    i += 2;
                }
                "--mailbox-capacity" => {
                    mailbox_capacity = parse_or_die(&take_value(&args, i, flag), "mailbox capacity");
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("TQCache version {}", tqcache::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", flag);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        let mut config = Config::default();

        // Config file first, explicit flags on top.
        if let Some(path) = &config_file {
            let file = FileConfig::load(path).unwrap_or_else(|e| {
                eprintln!("Error: failed to load config file: {}", e);
                std::process::exit(1);
            });
            file.apply_to(&mut config.cache);
            if let Some(listen) = file.listen {
                config.listen = normalize_listen(&listen);
            }
            info!(path = %path.display(), "loaded config file");
        }

        if let Some(socket) = socket_path {
            config.listen = socket;
        } else if listen_host.is_some() || port.is_some() {
            let host = listen_host.unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.unwrap_or(tqcache::DEFAULT_PORT);
            config.listen = format!("{}:{}", host, port);
        }

        if let Some(n) = max_connections {
            config.max_connections = n;
        }
        if let Some(n) = shards {
            config.cache.shards = n;
        }
        if let Some(dir) = data_dir {
            config.cache.data_dir = dir;
        }
        if let Some(ttl) = default_ttl {
            config.cache.default_ttl = ttl;
        }
        if let Some(ttl) = max_ttl {
            config.cache.max_ttl = ttl;
        }
        if let Some(mode) = sync_mode {
            config.cache.sync_mode = mode;
        }
        if let Some(interval) = sync_interval {
            config.cache.sync_interval = interval;
        }
        if let Some(capacity) = mailbox_capacity {
            config.cache.mailbox_capacity = capacity;
        }

        config
    }
}

fn parse_or_die<T: std::str::FromStr>(value: &str, what: &str) -> Option<T> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            eprintln!("Error: invalid {}: {}", what, value);
            std::process::exit(1);
        }
    }
}

fn duration_or_die(value: &str, what: &str) -> Duration {
    parse_duration(value).unwrap_or_else(|| {
        eprintln!(
            "Error: invalid {}: {} (use forms like 500ms, 30s, 5m, 1h)",
            what, value
        );
        std::process::exit(1);
    })
}

/// Turns a `:11211`-style listen value into a bindable address.
fn normalize_listen(listen: &str) -> String {
    if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        listen.to_string()
    }
}

fn print_help() {
    println!(
        r#"
TQCache - A Persistent Memcached-Compatible Key-Value Cache

USAGE:
    tqcache [OPTIONS]

MEMCACHED-COMPATIBLE OPTIONS:
    -p, --port <PORT>          TCP port to listen on (default: 11211)
    -l, --listen <HOST>        Interface to listen on (default: 0.0.0.0)
    -s, --socket <PATH>        Unix socket path (overrides -p and -l)
    -c, --connections <NUM>    Max simultaneous connections (default: 1024)
    -t, --threads <NUM>        Number of shards (default: 16)

TQCACHE OPTIONS:
        --config <FILE>        Path to INI config file
        --data-dir <PATH>      Directory for data files (default: data)
        --default-ttl <DUR>    Default TTL for keys without one (default: 0)
        --max-ttl <DUR>        Maximum TTL cap, 0 = unlimited (default: 0)
        --sync-mode <MODE>     none, periodic or always (default: periodic)
        --sync-interval <DUR>  Interval for periodic fsync (default: 1s)
        --mailbox-capacity <N> Request queue depth per shard (default: 1000)
    -v, --version              Print version information
        --help                 Print this help message

EXAMPLES:
    tqcache                                  # 0.0.0.0:11211, ./data
    tqcache -p 11212 --data-dir /var/cache   # custom port and data dir
    tqcache -s /run/tqcache.sock             # Unix socket
    tqcache --sync-mode always               # fsync every write

CONNECTING:
    Any memcached client works:
    $ printf 'set greeting 0 0 5\r\nhello\r\nget greeting\r\nquit\r\n' | nc localhost 11211
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = Config::from_args();

    let cache = Arc::new(Cache::open(config.cache.clone())?);
    let stats = Arc::new(ConnectionStats::new());

    info!(
        listen = %config.listen,
        shards = config.cache.shards,
        max_connections = config.max_connections,
        data_dir = %config.cache.data_dir.display(),
        "TQCache v{} started", tqcache::VERSION
    );

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("shutdown signal received, stopping server...");
    };

    if config.listen.starts_with('/') {
        // Stale socket files keep bind() from succeeding.
        let _ = std::fs::remove_file(&config.listen);
        let listener = UnixListener::bind(&config.listen)?;
        tokio::select! {
            _ = unix_accept_loop(listener, Arc::clone(&cache), Arc::clone(&stats), config.max_connections) => {}
            _ = shutdown => {}
        }
        let _ = std::fs::remove_file(&config.listen);
    } else {
        let listener = TcpListener::bind(&config.listen).await?;
        tokio::select! {
            _ = tcp_accept_loop(listener, Arc::clone(&cache), Arc::clone(&stats), config.max_connections) => {}
            _ = shutdown => {}
        }
    }

    // Cooperative shutdown: release our handle so in-flight connections
    // finish, then drain and close the shards.
    match Arc::try_unwrap(cache) {
        Ok(cache) => cache.close().await,
        Err(_) => warn!("connections still active at shutdown; skipping engine drain"),
    }

    info!("server shutdown complete");
    Ok(())
}

async fn tcp_accept_loop(
    listener: TcpListener,
    cache: Arc<Cache>,
    stats: Arc<ConnectionStats>,
    max_connections: u64,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if stats.active() >= max_connections {
                    warn!(client = %addr, limit = max_connections, "connection limit reached, rejecting");
                    stats.connection_rejected();
                    continue; // dropping the stream closes it
                }
                let commands = CommandHandler::new(Arc::clone(&cache));
                let stats = Arc::clone(&stats);
                tokio::spawn(handle_connection(stream, addr.to_string(), commands, stats));
            }
            Err(e) => error!("failed to accept connection: {}", e),
        }
    }
}

async fn unix_accept_loop(
    listener: UnixListener,
    cache: Arc<Cache>,
    stats: Arc<ConnectionStats>,
    max_connections: u64,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                if stats.active() >= max_connections {
                    warn!(limit = max_connections, "connection limit reached, rejecting");
                    stats.connection_rejected();
                    continue;
                }
                let commands = CommandHandler::new(Arc::clone(&cache));
                let stats = Arc::clone(&stats);
                tokio::spawn(handle_connection(
                    stream,
                    "unix-socket".to_string(),
                    commands,
                    stats,
                ));
            }
            Err(e) => error!("failed to accept connection: {}", e),
        }
    }
}
