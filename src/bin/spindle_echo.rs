//! Spindle Echo Server
//!
//! Echoes every byte back through the full stack: acceptors, selector sets,
//! worker pool and pooled buffers.
//!
//! Usage:
//!   cargo run --release --bin spindle_echo [OPTIONS]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use spindle::buffer::{Buf, BufMut, Buffer};
use spindle::network::{Connection, ConnectionFactory, EndPoint, Fill, Handled, SelectConnector, SelectEndpoint};
use spindle::pool::{BufferSource, Buffers};
use spindle::{LifeCycle, ServerConfig, WorkerContext, WorkerPool};

/// Command line options
struct Options {
    server: ServerConfig,
    stats_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        let mut server = ServerConfig::default();
        server.connector.addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        Self {
            server,
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Server statistics
struct EchoStats {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl EchoStats {
    fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    fn print_stats(&self, uptime: Duration, pool: &WorkerPool, connector: &SelectConnector) {
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        let secs = uptime.as_secs_f64().max(f64::EPSILON);

        println!("\n📊 Echo Stats (uptime: {:.1}s)", uptime.as_secs_f64());
        println!("   Bytes in:      {} KB ({:.1} KB/sec)", bytes_in / 1024, bytes_in as f64 / 1024.0 / secs);
        println!("   Bytes out:     {} KB ({:.1} KB/sec)", bytes_out / 1024, bytes_out as f64 / 1024.0 / secs);
        println!(
            "   Connections:   {} active / {} total",
            self.connections_active.load(Ordering::Relaxed),
            self.connections_total.load(Ordering::Relaxed)
        );
        println!("   Workers:       {}", pool);
        println!("   Connector:     {}", connector);
    }
}

/// Echoes through one header buffer checked out from the running worker.
/// Bytes the socket would not take stay in the buffer until the endpoint is
/// writable again.
struct EchoConnection {
    source: BufferSource,
    pending: Option<Buffer>,
    stats: Arc<EchoStats>,
}

impl EchoConnection {
    fn new(source: BufferSource, stats: Arc<EchoStats>) -> Self {
        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self {
            source,
            pending: None,
            stats,
        }
    }
}

impl Connection for EchoConnection {
    fn handle(&mut self, endpoint: &Arc<SelectEndpoint>, worker: &WorkerContext) -> io::Result<Handled> {
        let buffers = self.source.checkout(worker);
        let mut buffer = match self.pending.take() {
            Some(buffer) => buffer,
            None => buffers.get_header()?,
        };

        loop {
            if buffer.has_content() {
                let n = endpoint.flush(&mut buffer)?;
                self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                if buffer.has_content() {
                    self.pending = Some(buffer);
                    return Ok(Handled::Continue);
                }
            }

            buffer.clear()?;
            match endpoint.fill(&mut buffer)? {
                Fill::Eof => {
                    endpoint.close()?;
                    break;
                }
                Fill::Bytes(0) => break,
                Fill::Bytes(n) => {
                    self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                }
            }
        }

        buffers.return_buffer(buffer);
        Ok(Handled::Continue)
    }

    fn on_close(&mut self) {
        if let Some(buffer) = self.pending.take() {
            self.source.release(buffer);
        }
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

fn run_server(options: Options) -> spindle::Result<()> {
    options.server.validate()?;
    let buffers = options.server.exchange_buffers()?;

    let pool = Arc::new(WorkerPool::new(options.server.workers.clone())?);
    pool.start()?;

    let stats = Arc::new(EchoStats::new());
    let factory: Arc<dyn ConnectionFactory> = {
        let source: BufferSource = buffers.request.clone();
        let stats = Arc::clone(&stats);
        Arc::new(move |_: &Arc<SelectEndpoint>| -> Box<dyn Connection> {
            Box::new(EchoConnection::new(source.clone(), Arc::clone(&stats)))
        })
    };

    let connector = SelectConnector::new(options.server.connector, pool.clone(), factory)?;
    connector.start()?;

    println!("🚀 Spindle echo server listening on {:?}", connector.local_addr());
    println!("   Selector sets: {}", options.server.connector.selector.select_sets);
    println!("   Acceptors:     {}", options.server.connector.acceptors);
    println!(
        "   Workers:       {}..{}",
        options.server.workers.min_threads, options.server.workers.max_threads
    );

    let start_time = Instant::now();
    loop {
        std::thread::sleep(options.stats_interval);
        stats.print_stats(start_time.elapsed(), &pool, &connector);
    }
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    if let Ok(addr) = args[i + 1].parse() {
                        options.server.connector.addr = addr;
                    }
                    i += 1;
                }
            }
            "--acceptors" => {
                if i + 1 < args.len() {
                    options.server.connector.acceptors = args[i + 1].parse().unwrap_or(1);
                    i += 1;
                }
            }
            "--selectors" => {
                if i + 1 < args.len() {
                    options.server.connector.selector.select_sets = args[i + 1].parse().unwrap_or(1);
                    i += 1;
                }
            }
            "--min-threads" => {
                if i + 1 < args.len() {
                    options.server.workers.min_threads = args[i + 1].parse().unwrap_or(8);
                    i += 1;
                }
            }
            "--max-threads" => {
                if i + 1 < args.len() {
                    options.server.workers.max_threads = args[i + 1].parse().unwrap_or(254);
                    i += 1;
                }
            }
            "--max-buffers" => {
                if i + 1 < args.len() {
                    options.server.request_buffers.max_buffers = args[i + 1].parse().unwrap_or(1024);
                    i += 1;
                }
            }
            "--idle" => {
                if i + 1 < args.len() {
                    options.server.connector.selector.max_idle =
                        args[i + 1].parse().ok().filter(|&s| s > 0).map(Duration::from_secs);
                    i += 1;
                }
            }
            "--stats" => {
                if i + 1 < args.len() {
                    options.stats_interval = Duration::from_secs(args[i + 1].parse::<u64>().unwrap_or(5).max(1));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Spindle Echo Server\n");
                println!("Usage: spindle_echo [OPTIONS]\n");
                println!("Options:");
                println!("  -b, --bind <ADDR>        Bind address (default: 0.0.0.0:9999)");
                println!("      --acceptors <N>      Acceptor threads (default: 1)");
                println!("      --selectors <N>      Selector sets (default: 1)");
                println!("      --min-threads <N>    Minimum worker threads (default: 8)");
                println!("      --max-threads <N>    Maximum worker threads (default: 254)");
                println!("      --max-buffers <N>    Pooled request buffers, negative for per-connection caches (default: 1024)");
                println!("      --idle <SECS>        Idle timeout, 0 disables (default: 200)");
                println!("      --stats <SECS>       Stats interval (default: 5)");
                println!("  -h, --help               Show this help");
                println!("\nLog level is read from RUST_LOG (default: info).");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    options
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let options = parse_args();

    if let Err(e) = run_server(options) {
        eprintln!("❌ Server error: {}", e);
        std::process::exit(1);
    }
}
