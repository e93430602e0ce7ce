//! End-to-end tests: client -> relay -> backend over loopback sockets

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use tcprelay::relay::{BackpressureAction, EngineStats};
use tcprelay::{Config, ConnectionManager};

struct RunningRelay {
    addr: SocketAddr,
    stats: Arc<EngineStats>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

fn relay_config(backend: SocketAddr) -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.server.shutdown_timeout = Duration::from_secs(5);
    config.relay.backend_addr = backend.to_string();
    config.relay.connect_timeout = Duration::from_secs(2);
    config
}

async fn start_relay(config: Config) -> RunningRelay {
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut manager = ConnectionManager::with_shutdown(Arc::new(config), shutdown_tx.clone());
    let addr = tokio_test::assert_ok!(manager.bind().await);
    let stats = manager.stats();

    let handle = tokio::spawn(async move {
        if let Err(e) = manager.start().await {
            eprintln!("Relay error: {}", e);
        }
    });

    RunningRelay { addr, stats, shutdown_tx, handle }
}

/// Backend that echoes everything back until the peer closes
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Read until EOF or a reset, returning what arrived
async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return received,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
            Err(_) => panic!("connection was not closed"),
        }
    }
}

async fn wait_for_idle(stats: &EngineStats) {
    timeout(Duration::from_secs(5), async {
        while stats.active_sessions() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sessions did not drain");
}

#[tokio::test]
async fn test_bytes_relayed_in_order_both_ways() {
    let backend = spawn_echo_backend().await;
    let relay = start_relay(relay_config(backend)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let (mut reader, mut writer) = client.split();
    let write = async {
        for chunk in payload.chunks(7_919) {
            writer.write_all(chunk).await.unwrap();
        }
    };
    let read = async {
        let mut echoed = vec![0u8; payload.len()];
        reader.read_exact(&mut echoed).await.unwrap();
        echoed
    };
    let ((), echoed) = timeout(Duration::from_secs(10), async { tokio::join!(write, read) })
        .await
        .expect("relay stalled");
    assert_eq!(echoed, payload);

    drop(client);
    wait_for_idle(&relay.stats).await;
    let snapshot = relay.stats.snapshot();
    assert_eq!(snapshot.total_sessions, 1);
    assert_eq!(snapshot.bytes_up, payload.len() as u64);
    assert_eq!(snapshot.bytes_down, payload.len() as u64);

    relay.handle.abort();
}

#[tokio::test]
async fn test_early_bytes_reach_backend_first() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = start_relay(relay_config(backend.local_addr().unwrap())).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"GET /\r\n").await.unwrap();

    let (mut upstream, _) = timeout(Duration::from_secs(5), backend.accept()).await.unwrap().unwrap();
    let mut first = [0u8; 7];
    timeout(Duration::from_secs(5), upstream.read_exact(&mut first)).await.unwrap().unwrap();
    assert_eq!(&first, b"GET /\r\n");

    client.write_all(b"Host: x\r\n").await.unwrap();
    let mut next = [0u8; 9];
    timeout(Duration::from_secs(5), upstream.read_exact(&mut next)).await.unwrap().unwrap();
    assert_eq!(&next, b"Host: x\r\n");

    relay.handle.abort();
}

#[tokio::test]
async fn test_unreachable_backend_closes_client() {
    // Bind then drop to get a port nothing listens on
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    drop(backend);

    let relay = start_relay(relay_config(backend_addr)).await;
    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let received = read_to_close(&mut client).await;
    assert!(received.is_empty());

    drop(client);
    wait_for_idle(&relay.stats).await;
    assert_eq!(relay.stats.snapshot().bytes_up, 0);

    relay.handle.abort();
}

#[tokio::test]
async fn test_client_disconnect_closes_backend() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = start_relay(relay_config(backend.local_addr().unwrap())).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let (mut upstream, _) = timeout(Duration::from_secs(5), backend.accept()).await.unwrap().unwrap();

    let mut buf = [0u8; 4];
    upstream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(client);
    assert!(read_to_close(&mut upstream).await.is_empty());

    drop(upstream);
    wait_for_idle(&relay.stats).await;
    relay.handle.abort();
}

#[tokio::test]
async fn test_backend_disconnect_closes_client() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = start_relay(relay_config(backend.local_addr().unwrap())).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    let (mut upstream, _) = timeout(Duration::from_secs(5), backend.accept()).await.unwrap().unwrap();

    upstream.write_all(b"bye").await.unwrap();
    drop(upstream);

    // Data written before the close is still delivered
    assert_eq!(read_to_close(&mut client).await, b"bye");

    drop(client);
    wait_for_idle(&relay.stats).await;
    assert_eq!(relay.stats.snapshot().bytes_down, 3);
    relay.handle.abort();
}

#[tokio::test]
async fn test_slow_backend_trips_high_water_mark() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = relay_config(backend.local_addr().unwrap());
    config.server.read_buffer_size = 4096;
    config.relay.high_water_mark = 64 * 1024;
    config.relay.on_high_water_mark = BackpressureAction::Close;
    let relay = start_relay(config).await;

    let client = TcpStream::connect(relay.addr).await.unwrap();
    // Accept and never read
    let (_upstream, _) = timeout(Duration::from_secs(5), backend.accept()).await.unwrap().unwrap();

    let (mut reader, mut writer) = client.into_split();
    let flood = tokio::spawn(async move {
        let chunk = vec![0x5au8; 64 * 1024];
        for _ in 0..(32 * 1024 * 1024 / chunk.len()) {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    // The backend leg is cut, then the client leg is shut down
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(10), reader.read(&mut buf))
        .await
        .expect("client leg was not shut down")
        .unwrap_or(0);
    assert_eq!(n, 0);

    timeout(Duration::from_secs(10), flood).await.unwrap().unwrap();
    drop(reader);
    wait_for_idle(&relay.stats).await;
    assert!(relay.stats.snapshot().backpressure_trips >= 1);

    relay.handle.abort();
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_clients() {
    let backend = spawn_echo_backend().await;
    let mut config = relay_config(backend);
    config.server.max_connections = 1;
    let relay = start_relay(config).await;

    let mut first = TcpStream::connect(relay.addr).await.unwrap();
    first.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    timeout(Duration::from_secs(5), first.read_exact(&mut buf)).await.unwrap().unwrap();

    let mut second = TcpStream::connect(relay.addr).await.unwrap();
    assert!(read_to_close(&mut second).await.is_empty());
    assert_eq!(relay.stats.snapshot().rejected_connections, 1);
    assert_eq!(relay.stats.active_sessions(), 1);

    relay.handle.abort();
}

#[tokio::test]
async fn test_graceful_shutdown_disconnects_sessions() {
    let backend = spawn_echo_backend().await;
    let relay = start_relay(relay_config(backend)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await.unwrap().unwrap();

    relay.shutdown_tx.send(()).unwrap();

    // Backend leg is shut down, the echo backend closes, and the client follows
    assert!(read_to_close(&mut client).await.is_empty());
    drop(client);

    timeout(Duration::from_secs(5), relay.handle).await.unwrap().unwrap();
    assert_eq!(relay.stats.active_sessions(), 0);
    assert!(TcpStream::connect(relay.addr).await.is_err());
}
