//! Common utilities for integration tests
#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;
use tunnel_relay::config::{GatewayConfig, HostConfig, TunnelSpec, UserConfig};
use tunnel_relay::session::CredentialProvider;
use tunnel_relay::Gateway;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "correct horse";

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use std::sync::atomic::AtomicU64;
    use tunnel_relay::tls;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::write_self_signed(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Create a simple echo server for testing, returns its address
pub async fn start_echo_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break, // Connection closed
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    addr
}

/// A running gateway and the files it uses
pub struct TestGateway {
    pub addr: SocketAddr,
    pub cert_path: PathBuf,
    shutdown: tokio_util::sync::CancellationToken,
    _cleanup: TestCleanup,
}

impl TestGateway {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with<F: FnOnce(&mut GatewayConfig)>(customize: F) -> Self {
        let (cert_path, key_path) = generate_test_certs();
        let mut config = GatewayConfig::new("127.0.0.1", 0);
        config.cert_path = Some(cert_path.clone());
        config.key_path = Some(key_path.clone());
        config.dial_timeout = 2;
        config.users.push(UserConfig {
            name: USER.to_string(),
            password: PASSWORD.to_string(),
        });
        customize(&mut config);

        let gateway = Gateway::from_config(config)
            .await
            .expect("Failed to start gateway");
        let addr = gateway.local_addr().expect("Failed to get gateway addr");
        let shutdown = gateway.shutdown_token();
        tokio::spawn(gateway.run());

        Self {
            addr,
            cert_path: cert_path.clone(),
            shutdown,
            _cleanup: TestCleanup::new(cert_path, key_path),
        }
    }

    /// Host configuration that trusts this gateway's certificate
    pub fn host(&self, password: Option<&str>, tunnels: Vec<TunnelSpec>) -> HostConfig {
        let mut host = HostConfig::new(self.addr.to_string(), USER);
        host.password = password.map(str::to_string);
        host.server_name = Some("localhost".to_string());
        host.ca_cert_path = Some(self.cert_path.clone());
        host.timeout = 5;
        host.retry_delay = 1;
        host.keepalive_interval = 0;
        host.tunnels = tunnels;
        host
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Credential provider that counts how often it is asked
pub struct CountingPrompt {
    secret: String,
    calls: AtomicUsize,
}

impl CountingPrompt {
    pub fn new(secret: &str) -> Arc<Self> {
        Arc::new(Self {
            secret: secret.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialProvider for CountingPrompt {
    fn prompt(&self, _user: &str, _address: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.secret.clone())
    }
}

/// Send data and read the same amount back
pub async fn echo_roundtrip(stream: &mut TcpStream, data: &[u8]) -> Result<Vec<u8>, String> {
    timeout(Duration::from_secs(5), async {
        stream
            .write_all(data)
            .await
            .map_err(|e| format!("Failed to write data: {}", e))?;

        let mut response = vec![0u8; data.len()];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;
        Ok(response)
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// Assert the peer closed the connection
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("Connection was not closed in time");
    assert!(
        matches!(read, Ok(0) | Err(_)),
        "Expected closed connection, got {:?}",
        read
    );
}

/// Poll until the condition holds
pub async fn wait_until<F: Fn() -> bool>(cond: F, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Wait for a TCP port to accept connections
pub async fn wait_for_port(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}
