use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::gateway::GatewayHandler;
use crate::rules::TlsSnapshot;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// One listen address for a profile: accepts TCP (optionally TLS-wrapped)
/// connections, tracks how many are active, and supports graceful draining.
/// Draining stops the accept loop (closing the socket), asks each live
/// connection to finish its in-flight exchange, and force-closes whatever
/// outlives the budget.
pub struct Listener {
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<GatewayHandler>,
    socket: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    conn_tasks: Mutex<JoinSet<()>>,
    active: AtomicI64,
    draining: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        tls: Option<Arc<ServerConfig>>,
        handler: Arc<GatewayHandler>,
    ) -> Result<Arc<Self>> {
        let socket = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;
        let local_addr = socket.local_addr().context("failed to read bound address")?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            addr: local_addr,
            tls: tls.map(TlsAcceptor::from),
            handler,
            socket: Mutex::new(Some(socket)),
            accept_task: Mutex::new(None),
            conn_tasks: Mutex::new(JoinSet::new()),
            active: AtomicI64::new(0),
            draining: AtomicBool::new(false),
            shutdown_tx,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn active_connections(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Start the accept loop. The socket closes as soon as the loop exits,
    /// so no new connection is accepted once drain begins.
    pub fn start(self: &Arc<Self>) {
        let socket = match lock(&self.socket).take() {
            Some(socket) => socket,
            None => return, // already started
        };

        let listener = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            info!(
                profile = listener.handler.profile_id(),
                addr = %listener.addr,
                tls = listener.tls.is_some(),
                "listener started"
            );

            loop {
                tokio::select! {
                    accepted = socket.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if listener.draining.load(Ordering::SeqCst) {
                                    continue;
                                }
                                let conn_listener = listener.clone();
                                let mut tasks = lock(&listener.conn_tasks);
                                while tasks.try_join_next().is_some() {}
                                tasks.spawn(async move {
                                    conn_listener.handle_connection(stream, peer).await;
                                });
                            }
                            Err(e) => {
                                debug!("accept error on {}: {}", listener.addr, e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            // socket drops here, closing the listen port
        });

        *lock(&self.accept_task) = Some(task);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(self.clone());

        match &self.tls {
            Some(acceptor) => {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("TLS handshake failed for {}: {}", peer, e);
                        return;
                    }
                };

                let snapshot = {
                    let (_, conn) = tls_stream.get_ref();
                    TlsSnapshot {
                        version: conn
                            .protocol_version()
                            .map(tls_version_code)
                            .unwrap_or(0),
                        sni: conn.server_name().map(str::to_string),
                    }
                };

                self.serve_io(tls_stream, peer, Some(snapshot)).await;
            }
            None => {
                self.serve_io(stream, peer, None).await;
            }
        }
    }

    async fn serve_io<I>(&self, io: I, peer: SocketAddr, tls: Option<TlsSnapshot>)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = self.handler.clone();
        let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
            let handler = handler.clone();
            let tls = tls.clone();
            async move {
                let req = req.map(axum::body::Body::new);
                Ok::<_, Infallible>(handler.handle(req, peer, tls).await)
            }
        });

        let io = IdleTimeoutIo::new(io, IDLE_TIMEOUT);
        let conn = hyper::server::conn::http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut draining = false;
        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!("connection error from {}: {}", peer, e);
                    }
                    return;
                }
                _ = shutdown_rx.changed(), if !draining => {
                    // finish the in-flight exchange, then close
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }

    /// Graceful drain: stop accepting, wait for in-flight connections to
    /// finish or the budget to elapse, then force-close whatever remains.
    pub async fn shutdown(&self, timeout: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + timeout;
        while self.active_connections() > 0 {
            if Instant::now() >= deadline {
                let remaining = self.active_connections();
                warn!(
                    "drain timeout on {}: force-closing {} connection(s)",
                    self.addr, remaining
                );
                lock(&self.conn_tasks).abort_all();
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }

        info!(addr = %self.addr, "listener stopped");
    }
}

struct ActiveGuard(Arc<Listener>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Progress watchdog over a connection's IO. The deadline resets whenever a
/// read or write makes progress; a connection that stalls past the timeout
/// fails with `TimedOut`. This bounds idle keep-alive connections, slow
/// request bodies, and stalled response writes, which hyper's http1 builder
/// does not time out on its own.
struct IdleTimeoutIo<I> {
    io: I,
    timeout: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
}

impl<I> IdleTimeoutIo<I> {
    fn new(io: I, timeout: Duration) -> Self {
        Self {
            io,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn reset(&mut self) {
        self.deadline
            .as_mut()
            .reset(tokio::time::Instant::now() + self.timeout);
    }

    fn timed_out() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "connection idle timeout")
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for IdleTimeoutIo<I> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.reset();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(Self::timed_out()));
                }
                Poll::Pending
            }
        }
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutIo<I> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.reset();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(Self::timed_out()));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn tls_version_code(version: rustls::ProtocolVersion) -> u16 {
    match version {
        rustls::ProtocolVersion::TLSv1_0 => 0x0301,
        rustls::ProtocolVersion::TLSv1_1 => 0x0302,
        rustls::ProtocolVersion::TLSv1_2 => 0x0303,
        rustls::ProtocolVersion::TLSv1_3 => 0x0304,
        _ => 0,
    }
}

/// Load certificates and key from disk and build a server config requiring
/// TLS 1.2 or newer. rustls only ships ECDHE AEAD suites (AES-GCM and
/// ChaCha20-Poly1305), which is exactly the intended allowlist.
pub fn load_tls_config(cert_file: &str, key_file: &str) -> Result<Arc<ServerConfig>> {
    let cert_bytes = std::fs::read(cert_file)
        .with_context(|| format!("failed to read certificate: {}", cert_file))?;
    let key_bytes = std::fs::read(key_file)
        .with_context(|| format!("failed to read private key: {}", key_file))?;

    let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificate: {}", cert_file))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_file);
    }

    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .with_context(|| format!("failed to parse private key: {}", key_file))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_file))?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| anyhow::anyhow!("invalid TLS material: {}", e))?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Bind a listener and start its accept loop
pub async fn bind_and_start(
    addr: &str,
    tls: Option<Arc<ServerConfig>>,
    handler: Arc<GatewayHandler>,
) -> Result<Arc<Listener>> {
    let listener = Listener::bind(addr, tls, handler).await?;
    listener.start();
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, DecoyConfig, GlobalConfig, ProfileConfig, RulesConfig};
    use crate::observability::{Logger, Metrics};
    use crate::proxy::{Backend, Pool};
    use axum::routing::get;
    use axum::Router;

    async fn spawn_upstream(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn handler_for(backend_url: &str) -> Arc<GatewayHandler> {
        let profile = ProfileConfig {
            id: "test".to_string(),
            listeners: Vec::new(),
            backends: vec![BackendConfig {
                name: "primary".to_string(),
                url: backend_url.to_string(),
                weight: 1,
                timeout: None,
                health_check_path: None,
            }],
            rules: RulesConfig::default(),
            decoy: DecoyConfig::default(),
            shaping: None,
            max_retries: None,
        };

        let pool = Arc::new(Pool::new());
        pool.add(Arc::new(Backend::new("primary", backend_url, 1).unwrap()));

        Arc::new(
            GatewayHandler::from_profile(
                &profile,
                &GlobalConfig::default(),
                pool,
                None,
                Arc::new(Logger::open("stdout").await.unwrap()),
                Arc::new(Metrics::new()),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_listener_serves_requests() {
        let upstream = spawn_upstream(Router::new().route("/", get(|| async { "hello" }))).await;
        let handler = handler_for(&upstream).await;

        let listener = bind_and_start("127.0.0.1:0", None, handler).await.unwrap();
        let addr = listener.local_addr();

        let response = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "hello");

        listener.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_graceful_drain_waits_for_inflight_request() {
        let upstream = spawn_upstream(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "done"
            }),
        ))
        .await;
        let handler = handler_for(&upstream).await;

        let listener = bind_and_start("127.0.0.1:0", None, handler).await.unwrap();
        let addr = listener.local_addr();

        let request =
            tokio::spawn(async move { reqwest::get(format!("http://{}/slow", addr)).await });

        // let the request get in flight
        tokio::time::sleep(Duration::from_millis(50)).await;

        let drain_started = Instant::now();
        listener.shutdown(Duration::from_secs(5)).await;

        // shutdown returned only after the in-flight request completed
        assert!(drain_started.elapsed() >= Duration::from_millis(100));

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.text().await.unwrap(), "done");

        // and no new connection is accepted afterwards
        let err = TcpStream::connect(addr).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_drain_timeout_force_closes() {
        let upstream = spawn_upstream(Router::new().route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "never"
            }),
        ))
        .await;
        let handler = handler_for(&upstream).await;

        let listener = bind_and_start("127.0.0.1:0", None, handler).await.unwrap();
        let addr = listener.local_addr();

        tokio::spawn(async move { reqwest::get(format!("http://{}/hang", addr)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        listener.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_idle_timeout_io_fails_stalled_read() {
        use tokio::io::AsyncReadExt;

        let (client, server) = tokio::io::duplex(64);
        let mut wrapped = IdleTimeoutIo::new(server, Duration::from_millis(50));

        let mut buf = [0u8; 8];
        let err = wrapped.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        drop(client);
    }

    #[tokio::test]
    async fn test_idle_timeout_io_resets_on_progress() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut client, server) = tokio::io::duplex(64);
        let mut wrapped = IdleTimeoutIo::new(server, Duration::from_millis(100));

        // traffic before the deadline keeps the connection alive
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            wrapped.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }

        // then a stall past the deadline fails
        let mut buf = [0u8; 4];
        let err = wrapped.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_tls_version_codes() {
        assert_eq!(tls_version_code(rustls::ProtocolVersion::TLSv1_2), 0x0303);
        assert_eq!(tls_version_code(rustls::ProtocolVersion::TLSv1_3), 0x0304);
    }

    #[test]
    fn test_load_tls_config_missing_files() {
        assert!(load_tls_config("/nonexistent/cert.pem", "/nonexistent/key.pem").is_err());
    }
}
