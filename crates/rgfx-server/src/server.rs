use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use rgfx_core::config::{GraphicsConfig, RgfxConfig, ServerConfig};
use rgfx_protocol::messages::{Hello, HelloAck, MetricsData, Pong, PROTOCOL_VERSION};
use rgfx_protocol::{Frame, Message, ProtocolError, CATALOG_VERSION};
use rgfx_transport::framing::{read_frame, write_frame};
use rgfx_transport::TransportError;

use crate::error::ServerError;
use crate::session::{BackendFactory, Session};
use crate::software::{SoftwareBackend, SoftwareConfig};

/// How long shutdown waits for open channels to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// What ended one wait on a channel's socket.
enum ChannelEvent {
    Frame(Result<Frame, TransportError>),
    /// No frame on any of the session's channels for `idle_timeout_secs`
    Idle,
    Shutdown,
}

/// Server-wide metrics tracked via atomic counters.
pub struct ServerMetrics {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU32,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub bakes_total: AtomicU64,
    pub bakes_failed: AtomicU64,
    pub start_time: Instant,
}

impl ServerMetrics {
    fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU32::new(0),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            bakes_total: AtomicU64::new(0),
            bakes_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MetricsData {
        MetricsData {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            bakes_total: self.bakes_total.load(Ordering::Relaxed),
            bakes_failed: self.bakes_failed.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

/// The rgfx host. Accepts channels, groups them into sessions and serves
/// each session's device.
pub struct RgfxServer {
    config: ServerConfig,
    graphics: GraphicsConfig,
    backends: BackendFactory,
    host_name: String,
    sessions: DashMap<u64, Arc<Session>>,
    next_session_id: AtomicU32,
    metrics: Arc<ServerMetrics>,
}

impl RgfxServer {
    /// Server whose sessions run on the software device.
    pub fn new(config: &RgfxConfig) -> Self {
        let backends: BackendFactory = Arc::new(|graphics: &GraphicsConfig| {
            Arc::new(SoftwareBackend::new(SoftwareConfig::from(graphics))) as _
        });
        Self::with_backends(config, backends)
    }

    pub fn with_backends(config: &RgfxConfig, backends: BackendFactory) -> Self {
        Self {
            config: config.server.clone(),
            graphics: config.graphics.clone(),
            backends,
            host_name: rgfx_common::platform::host_name(),
            sessions: DashMap::new(),
            next_session_id: AtomicU32::new(1),
            metrics: Arc::new(ServerMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        TcpListener::bind(&addr).await.map_err(|source| ServerError::Bind { addr, source })
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
        self.serve(listener, shutdown_rx).await
    }

    /// Accept channels on `listener` until `shutdown` flips to true.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let local = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: format!("{}:{}", self.config.bind, self.config.port),
            source,
        })?;
        info!("rgfx server listening on {} ({})", local, self.host_name);

        if self.config.metrics_interval_secs > 0 {
            let metrics = self.metrics.clone();
            let interval = Duration::from_secs(self.config.metrics_interval_secs);
            let mut metrics_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            let m = metrics.snapshot();
                            info!(
                                connections_total = m.connections_total,
                                connections_active = m.connections_active,
                                requests = m.requests_total,
                                errors = m.errors_total,
                                bakes = m.bakes_total,
                                bakes_failed = m.bakes_failed,
                                "metrics snapshot"
                            );
                        }
                        _ = metrics_shutdown.changed() => { break; }
                    }
                }
            });
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("accept failed: {}", e);
                            continue;
                        }
                    };
                    debug!("new connection from {}", peer);
                    self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
                    self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);

                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server.clone().handle_channel(stream, peer, shutdown).await;
                        server.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }

        // Wait for open channels to drain
        let remaining = self.metrics.connections_active.load(Ordering::Relaxed);
        if remaining > 0 {
            info!("waiting for {} channel(s) to finish (max {:?})", remaining, DRAIN_TIMEOUT);
            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            while self.metrics.connections_active.load(Ordering::Relaxed) > 0
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let still_active = self.metrics.connections_active.load(Ordering::Relaxed);
            if still_active > 0 {
                warn!("{} channel(s) still active after drain timeout", still_active);
            }
        }

        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        self.sessions.clear();
        for session in sessions {
            let _ = tokio::task::spawn_blocking(move || session.close()).await;
        }

        info!("server shut down cleanly");
        Ok(())
    }

    /// Serve one channel: handshake, then request/response until the peer
    /// goes away, the whole session idles out or the server shuts down.
    async fn handle_channel(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let max_payload = self.config.frame_buffer_size;
        let idle = Duration::from_secs(self.config.idle_timeout_secs.max(1));

        let hello = match tokio::time::timeout(idle, read_frame(&mut reader, max_payload)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                debug!("{} closed before handshake: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!("{} sent no Hello within {:?}", peer, idle);
                return;
            }
        };

        let session = match self.accept_hello(hello.message) {
            Ok((session, ack)) => {
                if let Err(e) = write_frame(&mut writer, &Frame::new(ack), max_payload).await {
                    error!(session_id = session.session_id, "handshake write failed: {}", e);
                    self.channel_closed(session).await;
                    return;
                }
                session
            }
            Err(e) => {
                warn!("handshake from {} rejected: {}", peer, e);
                self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                let _ = write_frame(&mut writer, &Frame::new(Message::error(e)), max_payload).await;
                return;
            }
        };
        let session_id = session.session_id;

        loop {
            let read = {
                // One read future per frame, kept alive across idle checks so
                // a partially received frame is never dropped.
                let read = read_frame(&mut reader, max_payload);
                tokio::pin!(read);
                loop {
                    let remaining = idle.saturating_sub(session.idle_for());
                    if remaining.is_zero() {
                        break ChannelEvent::Idle;
                    }
                    tokio::select! {
                        frame = &mut read => break ChannelEvent::Frame(frame),
                        _ = tokio::time::sleep(remaining) => {}
                        _ = shutdown.changed() => break ChannelEvent::Shutdown,
                    }
                }
            };

            let frame = match read {
                ChannelEvent::Frame(Ok(frame)) => frame,
                ChannelEvent::Frame(Err(TransportError::ConnectionClosed)) => {
                    debug!(session_id, "channel closed by client");
                    break;
                }
                ChannelEvent::Frame(Err(e)) if !e.breaks_channel() => {
                    // The frame was consumed in full; the stream is still in sync.
                    warn!(session_id, "undecodable request: {}", e);
                    self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                    let reply = Message::error(ProtocolError::SerializationError(e.to_string()));
                    if write_frame(&mut writer, &Frame::new(reply), max_payload).await.is_err() {
                        break;
                    }
                    continue;
                }
                ChannelEvent::Frame(Err(e)) => {
                    info!(session_id, "channel dropped: {}", e);
                    break;
                }
                ChannelEvent::Idle => {
                    warn!(session_id, "session idle for {:?}, disconnecting channel", idle);
                    break;
                }
                ChannelEvent::Shutdown => {
                    debug!(session_id, "closing channel for shutdown");
                    break;
                }
            };

            session.request_started();
            let frames = self.handle_request(&session, frame).await;
            let mut failed = false;
            for frame in &frames {
                if let Err(e) = write_frame(&mut writer, frame, max_payload).await {
                    error!(session_id, "write error: {}", e);
                    failed = true;
                    break;
                }
            }
            session.request_finished();
            if failed {
                break;
            }
        }

        self.channel_closed(session).await;
    }

    /// Validate a Hello and open or join its session.
    fn accept_hello(&self, message: Message) -> Result<(Arc<Session>, HelloAck), ProtocolError> {
        let hello = Hello::try_from(message).map_err(|other| {
            ProtocolError::HandshakeFailed(format!("expected Hello, got {}", other.name()))
        })?;
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: hello.protocol_version,
            });
        }

        let session = if hello.session_token == 0 {
            if self.sessions.len() >= self.config.max_clients as usize {
                return Err(ProtocolError::ResourceExhausted(format!(
                    "max_clients ({}) reached",
                    self.config.max_clients
                )));
            }
            let token = loop {
                let token: u64 = rand::thread_rng().gen();
                if token != 0 && !self.sessions.contains_key(&token) {
                    break token;
                }
            };
            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let session = Arc::new(Session::new(session_id, token, hello.client_name.clone()));
            self.sessions.insert(token, session.clone());
            info!(session_id, client = %hello.client_name, "session opened");
            session
        } else {
            let session = self
                .sessions
                .get(&hello.session_token)
                .map(|e| e.value().clone())
                .ok_or_else(|| ProtocolError::HandshakeFailed("unknown session token".into()))?;
            if session.channel_count() >= self.config.channels {
                return Err(ProtocolError::ResourceExhausted(format!(
                    "session already has {} channel(s)",
                    self.config.channels
                )));
            }
            session
        };

        let open = session.channel_opened();
        debug!(session_id = session.session_id, channel = hello.channel, open, "channel joined");
        let ack = HelloAck {
            session_token: session.token,
            session_id: session.session_id,
            server_name: self.host_name.clone(),
        };
        Ok((session, ack))
    }

    async fn channel_closed(&self, session: Arc<Session>) {
        if !session.channel_closed() {
            return;
        }
        self.sessions.remove(&session.token);
        let session_id = session.session_id;
        if let Err(e) = tokio::task::spawn_blocking(move || session.close()).await {
            error!(session_id, "session teardown failed: {}", e);
        }
        info!(session_id, "client session ended");
    }

    /// Process one request. Returns the frames to send: pushes, then the
    /// response.
    async fn handle_request(&self, session: &Arc<Session>, frame: Frame) -> Vec<Frame> {
        self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

        let response = match &frame.message {
            Message::Ping(_) => Message::from(Pong),
            Message::QueryMetrics(_) => self.metrics.snapshot().into(),
            Message::DeviceInit(init) => {
                if init.catalog_version != CATALOG_VERSION {
                    Message::error(ProtocolError::VersionMismatch {
                        expected: u32::from(CATALOG_VERSION),
                        found: u32::from(init.catalog_version),
                    })
                } else {
                    info!(session_id = session.session_id, app = %init.app_name, "DeviceInit");
                    session.init_device(&self.backends, &self.graphics, &self.host_name).into()
                }
            }
            Message::Hello(_) => {
                Message::error(ProtocolError::HandshakeFailed("channel already joined".into()))
            }
            _ => return self.dispatch(session, frame).await,
        };

        if matches!(response, Message::ErrorResponse(_)) {
            self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        vec![Frame::new(response)]
    }

    async fn dispatch(&self, session: &Arc<Session>, frame: Frame) -> Vec<Frame> {
        let device = match session.device() {
            Ok(device) => device,
            Err(e) => {
                self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                return vec![Frame::new(Message::error(e.into()))];
            }
        };

        match tokio::task::spawn_blocking(move || device.dispatch(frame)).await {
            Ok(dispatched) => {
                if let Some(ok) = dispatched.baked {
                    self.metrics.bakes_total.fetch_add(1, Ordering::Relaxed);
                    if !ok {
                        self.metrics.bakes_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if matches!(dispatched.response.message, Message::ErrorResponse(_)) {
                    self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                }
                let mut frames = dispatched.pushes;
                frames.push(dispatched.response);
                frames
            }
            Err(e) => {
                error!(session_id = session.session_id, "device task failed: {}", e);
                self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                vec![Frame::new(Message::error(ProtocolError::Backend(e.to_string())))]
            }
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM on Unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); }
                    _ = sigterm.recv() => { info!("received SIGTERM, initiating shutdown"); }
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await;
                info!("received Ctrl+C, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received Ctrl+C, initiating shutdown");
    }
}
