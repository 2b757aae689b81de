//! Reactor Echo Test - loopback traffic through the whole stack
//!
//! Acceptors, selector sets, worker pool and pooled buffers, driven by real
//! TCP clients.
//!
//! Usage:
//!   cargo test --test reactor_echo_test -- --nocapture

#![cfg(unix)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spindle::buffer::{Buf, BufMut, Buffer, BufferKind};
use spindle::network::{
    Connection, ConnectionFactory, ConnectorConfig, EndPoint, Fill, Handled, SelectConnector, SelectEndpoint,
    SelectorConfig,
};
use spindle::pool::{BufferPoolConfig, BufferSource, Buffers};
use spindle::{LifeCycle, WorkerContext, WorkerPool, WorkerPoolConfig};

struct Echo {
    source: BufferSource,
    pending: Option<Buffer>,
    upper: bool,
    closed: Arc<AtomicUsize>,
}

impl Connection for Echo {
    fn handle(&mut self, endpoint: &Arc<SelectEndpoint>, worker: &WorkerContext) -> io::Result<Handled> {
        let buffers = self.source.checkout(worker);
        let mut buffer = match self.pending.take() {
            Some(buffer) => buffer,
            None => buffers.get_header()?,
        };

        loop {
            if buffer.has_content() {
                endpoint.flush(&mut buffer)?;
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
                Fill::Bytes(_) => {
                    if !self.upper && buffer.content().starts_with(b"UPGRADE") {
                        buffers.return_buffer(buffer);
                        return Ok(Handled::Upgrade(Box::new(Echo {
                            source: self.source.clone(),
                            pending: None,
                            upper: true,
                            closed: Arc::clone(&self.closed),
                        })));
                    }
                    if self.upper {
                        let upper = buffer.content().to_ascii_uppercase();
                        buffer.poke(buffer.get_index(), &upper)?;
                    }
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
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Server {
    connector: SelectConnector,
    pool: Arc<WorkerPool>,
    closed: Arc<AtomicUsize>,
    addr: SocketAddr,
}

fn start_server(selector: SelectorConfig, max_buffers: isize) -> Server {
    let pool = Arc::new(
        WorkerPool::new(WorkerPoolConfig {
            name: "echo-worker".into(),
            min_threads: 2,
            max_threads: 8,
            ..Default::default()
        })
        .unwrap(),
    );
    pool.start().unwrap();

    // small buffers so larger messages need several rounds
    let source: BufferSource = BufferPoolConfig::request()
        .header(64, BufferKind::ByteArray)
        .body(256, BufferKind::Direct)
        .max_buffers(max_buffers)
        .build()
        .unwrap();

    let closed = Arc::new(AtomicUsize::new(0));
    let factory: Arc<dyn ConnectionFactory> = {
        let closed = Arc::clone(&closed);
        Arc::new(move |_: &Arc<SelectEndpoint>| -> Box<dyn Connection> {
            Box::new(Echo {
                source: source.clone(),
                pending: None,
                upper: false,
                closed: Arc::clone(&closed),
            })
        })
    };

    let config = ConnectorConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        acceptors: 2,
        selector,
        ..Default::default()
    };
    let connector = SelectConnector::new(config, pool.clone(), factory).unwrap();
    connector.start().unwrap();
    let addr = connector.local_addr().unwrap();

    Server {
        connector,
        pool,
        closed,
        addr,
    }
}

fn two_sets() -> SelectorConfig {
    SelectorConfig {
        select_sets: 2,
        ..Default::default()
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_single_client_echo() {
    let server = start_server(two_sets(), 16);
    let mut client = connect(server.addr);

    for round in 0..10 {
        let msg = format!("hello spindle {round}\n");
        client.write_all(msg.as_bytes()).unwrap();
        let mut got = vec![0u8; msg.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, msg.as_bytes());
    }

    server.connector.stop().unwrap();
    server.pool.stop().unwrap();
}

#[test]
fn test_many_clients_across_sets() {
    let server = start_server(two_sets(), 16);
    let addr = server.addr;

    let clients: Vec<_> = (0..8)
        .map(|id| {
            thread::spawn(move || {
                let mut client = connect(addr);
                for round in 0..20 {
                    let msg = format!("client {id} round {round}|");
                    client.write_all(msg.as_bytes()).unwrap();
                    let mut got = vec![0u8; msg.len()];
                    client.read_exact(&mut got).unwrap();
                    assert_eq!(got, msg.as_bytes());
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    assert!(wait_for(Duration::from_secs(2), || server.connector.accepted() == 8));
    assert!(wait_for(Duration::from_secs(5), || server.closed.load(Ordering::SeqCst) == 8));
    server.connector.stop().unwrap();
}

#[test]
fn test_large_payload_survives_partial_writes() {
    let server = start_server(two_sets(), -1);
    let client = connect(server.addr);
    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

    let mut writer = client.try_clone().unwrap();
    let sent = payload.clone();
    let sender = thread::spawn(move || {
        writer.write_all(&sent).unwrap();
    });

    let mut reader = client;
    let mut got = vec![0u8; payload.len()];
    reader.read_exact(&mut got).unwrap();
    sender.join().unwrap();
    assert!(got == payload, "echoed bytes differ");

    server.connector.stop().unwrap();
}

#[test]
fn test_upgrade_switches_connection() {
    let server = start_server(two_sets(), 16);
    let mut client = connect(server.addr);

    client.write_all(b"UPGRADE").unwrap();
    thread::sleep(Duration::from_millis(100));
    client.write_all(b"shout").unwrap();

    let mut got = [0u8; 5];
    client.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"SHOUT");

    server.connector.stop().unwrap();
}

#[test]
fn test_idle_connection_is_half_closed() {
    let selector = SelectorConfig {
        select_sets: 1,
        max_idle: Some(Duration::from_millis(200)),
        idle_check_period: Duration::from_millis(50),
    };
    let server = start_server(selector, 16);
    let mut client = connect(server.addr);

    let started = Instant::now();
    let mut byte = [0u8; 1];
    // the server shuts its output down: end of stream, not a timeout
    assert_eq!(client.read(&mut byte).unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(150));

    // client closes its side; the endpoint closes and is notified once
    drop(client);
    assert!(wait_for(Duration::from_secs(5), || server.closed.load(Ordering::SeqCst) == 1));

    server.connector.stop().unwrap();
}

#[test]
fn test_stop_closes_connections_and_unblocks_acceptors() {
    let server = start_server(two_sets(), 16);
    let mut client = connect(server.addr);
    client.write_all(b"x").unwrap();
    let mut got = [0u8; 1];
    client.read_exact(&mut got).unwrap();

    server.connector.stop().unwrap();
    assert!(server.connector.is_stopped());
    assert_eq!(server.connector.manager().endpoints(), 0);

    let mut rest = [0u8; 1];
    assert_eq!(client.read(&mut rest).unwrap_or(0), 0);
    assert!(wait_for(Duration::from_secs(2), || server.closed.load(Ordering::SeqCst) == 1));
}
