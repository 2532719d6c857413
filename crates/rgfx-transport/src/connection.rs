use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use rgfx_core::config::ClientConfig;
use rgfx_protocol::messages::{Hello, HelloAck, Log, MessageKind};
use rgfx_protocol::wire::DEFAULT_MAX_PAYLOAD;
use rgfx_protocol::{Frame, Message, PROTOCOL_VERSION};

use crate::error::TransportError;
use crate::framing::{read_frame, write_frame};
use crate::pool::ChannelPool;

/// Anything a channel can run over: a TCP stream, or an in-memory duplex in
/// tests.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Receives host pushes (`Log`, `UploadDataAndCopy`) read while a request
/// waits for its response. Called inline on the requesting task.
pub trait PushHandler: Send + Sync {
    fn on_push(&self, frame: Frame);
}

/// Re-emits host log lines through `tracing` and drops everything else.
pub struct TracingPushHandler;

impl PushHandler for TracingPushHandler {
    fn on_push(&self, frame: Frame) {
        match frame.message {
            Message::Log(log) => emit_host_log(&log),
            other => warn!(message = other.name(), "unhandled push dropped"),
        }
    }
}

/// Forward one host log line at its original level.
pub fn emit_host_log(log: &Log) {
    let target = log.target.as_str();
    match log.level {
        0 => error!(host_target = target, "{}", log.message),
        1 => warn!(host_target = target, "{}", log.message),
        2 => info!(host_target = target, "{}", log.message),
        _ => debug!(host_target = target, "{}", log.message),
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub client_name: String,
    pub channels: u32,
    pub request_timeout: Duration,
    pub max_payload: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ConnectionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            client_name: config.client_name.clone(),
            channels: config.channels,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

struct Channel {
    stream: BufStream<Box<dyn ByteStream>>,
    lost: bool,
}

/// Client side of a multi-channel link to one host.
///
/// Every request leases one channel, writes one frame and reads until the
/// paired response arrives. Any channel failure marks the whole connection
/// lost; later requests fail fast with [`TransportError::ConnectionLost`].
pub struct Connection {
    channels: Vec<Mutex<Channel>>,
    pool: ChannelPool,
    lost_tx: watch::Sender<bool>,
    push: Arc<dyn PushHandler>,
    options: ConnectionOptions,
    session: HelloAck,
}

impl Connection {
    /// Open `options.channels` TCP streams to `addr` and join them into one
    /// session.
    pub async fn connect(
        addr: &str,
        options: ConnectionOptions,
        push: Arc<dyn PushHandler>,
    ) -> Result<Self, TransportError> {
        let mut streams: Vec<Box<dyn ByteStream>> = Vec::with_capacity(options.channels as usize);
        for _ in 0..options.channels.max(1) {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            streams.push(Box::new(stream));
        }
        Self::handshake(streams, options, push).await
    }

    /// Send `Hello` on each stream. The first opens the session; the rest
    /// join it with the returned token.
    pub async fn handshake(
        streams: Vec<Box<dyn ByteStream>>,
        options: ConnectionOptions,
        push: Arc<dyn PushHandler>,
    ) -> Result<Self, TransportError> {
        if streams.is_empty() {
            return Err(TransportError::Handshake("no channels".into()));
        }

        let mut session: Option<HelloAck> = None;
        let mut channels = Vec::with_capacity(streams.len());
        for (index, stream) in streams.into_iter().enumerate() {
            let mut stream = BufStream::new(stream);
            let hello = Hello {
                protocol_version: PROTOCOL_VERSION,
                client_name: options.client_name.clone(),
                session_token: session.as_ref().map_or(0, |s| s.session_token),
                channel: index as u8,
            };
            write_frame(&mut stream, &Frame::new(hello), options.max_payload).await?;
            let reply = tokio::time::timeout(
                options.request_timeout,
                read_frame(&mut stream, options.max_payload),
            )
            .await
            .map_err(|_| TransportError::Timeout(options.request_timeout))??;

            match reply.message {
                Message::HelloAck(ack) => {
                    if let Some(first) = &session {
                        if first.session_id != ack.session_id {
                            return Err(TransportError::Handshake(format!(
                                "channel {} joined session {} instead of {}",
                                index, ack.session_id, first.session_id
                            )));
                        }
                    } else {
                        session = Some(ack);
                    }
                }
                Message::ErrorResponse(e) => {
                    return Err(TransportError::Handshake(e.error.to_string()))
                }
                other => {
                    return Err(TransportError::UnexpectedResponse {
                        expected: HelloAck::NAME,
                        got: other.name(),
                    })
                }
            }
            channels.push(Mutex::new(Channel { stream, lost: false }));
        }

        let session =
            session.ok_or_else(|| TransportError::Handshake("no session acknowledged".into()))?;
        info!(
            session_id = session.session_id,
            server = %session.server_name,
            channels = channels.len(),
            "connected"
        );

        let (lost_tx, _) = watch::channel(false);
        let pool = ChannelPool::new(channels.len() as u32);
        Ok(Self { channels, pool, lost_tx, push, options, session })
    }

    /// Send `frame` and wait for its response on the same channel.
    ///
    /// An `ErrorResponse` from the host comes back as
    /// [`TransportError::Remote`] and leaves the channel usable.
    pub async fn request(&self, frame: Frame) -> Result<Frame, TransportError> {
        if self.is_lost() {
            return Err(TransportError::ConnectionLost);
        }
        let guard = self.pool.lock().await;
        let slot = guard.slot();
        let mut channel = self.channels[slot as usize].lock().await;
        if channel.lost || self.is_lost() {
            return Err(TransportError::ConnectionLost);
        }

        let name = frame.message.name();
        let timeout = self.options.request_timeout;
        let result = match tokio::time::timeout(timeout, self.exchange(&mut channel.stream, &frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match result {
            Err(e) if e.breaks_channel() => {
                channel.lost = true;
                error!(channel = slot, request = name, error = %e, "channel failed");
                self.mark_lost();
                Err(TransportError::ConnectionLost)
            }
            other => other,
        }
    }

    async fn exchange(
        &self,
        stream: &mut BufStream<Box<dyn ByteStream>>,
        frame: &Frame,
    ) -> Result<Frame, TransportError> {
        write_frame(stream, frame, self.options.max_payload).await?;
        loop {
            let reply = read_frame(stream, self.options.max_payload).await?;
            if reply.message.is_push() {
                self.push.on_push(reply);
                continue;
            }
            return match reply.message {
                Message::ErrorResponse(e) => Err(TransportError::Remote(e.error)),
                _ => Ok(reply),
            };
        }
    }

    /// Typed request: send `msg` and expect a `T` back.
    pub async fn call<T>(&self, msg: impl Into<Message>) -> Result<T, TransportError>
    where
        T: MessageKind + TryFrom<Message, Error = Message>,
    {
        self.call_frame(Frame::new(msg)).await
    }

    /// Typed request carrying a blob.
    pub async fn call_frame<T>(&self, frame: Frame) -> Result<T, TransportError>
    where
        T: MessageKind + TryFrom<Message, Error = Message>,
    {
        let reply = self.request(frame).await?;
        T::try_from(reply.message).map_err(|other| TransportError::UnexpectedResponse {
            expected: T::NAME,
            got: other.name(),
        })
    }

    fn mark_lost(&self) {
        if !self.lost_tx.send_replace(true) {
            warn!(session_id = self.session.session_id, "connection lost");
        }
    }

    pub fn is_lost(&self) -> bool {
        *self.lost_tx.borrow()
    }

    /// Flips to `true` once, when the first channel fails.
    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.lost_tx.subscribe()
    }

    pub fn session_id(&self) -> u32 {
        self.session.session_id
    }

    pub fn server_name(&self) -> &str {
        &self.session.server_name
    }

    pub fn channel_count(&self) -> u32 {
        self.pool.channel_count()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}
