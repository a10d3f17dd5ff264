//! Connection client for xproofd daemons
//!
//! Used by the admin tool, by daemons talking to their peers and by
//! session processes calling back to their parent daemon.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use url::Url;

use xpd_protocol::handshake::initiate_handshake;
use xpd_protocol::{
    AdminType, ClientCodec, LoginBody, ProofBody, ReadBufBody, Request, RequestId, Response,
    ResponseStatus, Role, SendRcvBody, StreamId,
};
use xpd_utils::{Result, XpdError};

/// Default daemon port
pub const DEFAULT_PORT: u16 = 1093;

/// Trait alias for streams that can be used with Framed
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamTrait for T {}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Parsed daemon address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonAddr {
    Tcp {
        user: Option<String>,
        host: String,
        port: u16,
    },
    Unix(PathBuf),
}

impl DaemonAddr {
    /// Parse `tcp://[user@]host[:port]`, `unix:///path`, a bare path or a
    /// bare `[user@]host[:port]`
    pub fn parse(addr: &str) -> Result<Self> {
        if addr.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(addr)));
        }
        if addr.starts_with("unix://") {
            let url = Url::parse(addr)
                .map_err(|e| XpdError::connection(format!("Invalid Unix URL '{}': {}", addr, e)))?;
            return Ok(Self::Unix(PathBuf::from(url.path())));
        }

        let with_scheme = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("tcp://{}", addr)
        };
        let url = Url::parse(&with_scheme)
            .map_err(|e| XpdError::connection(format!("Invalid URL '{}': {}", addr, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| XpdError::connection(format!("Missing host in '{}'", addr)))?
            .to_string();
        let user = Some(url.username().to_string()).filter(|u| !u.is_empty());
        Ok(Self::Tcp {
            user,
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

/// Parameters of a login request
#[derive(Debug, Clone)]
pub struct LoginParams {
    pub user: String,
    pub role: Role,
    /// Protocol version of the caller
    pub capver: u8,
    /// Session id for internal callbacks, client version otherwise
    pub reserved: i16,
    pub payload: Bytes,
}

impl LoginParams {
    pub fn new(user: impl Into<String>, role: Role) -> Self {
        Self {
            user: user.into(),
            role,
            capver: 1,
            reserved: 0,
            payload: Bytes::new(),
        }
    }

    pub fn with_reserved(mut self, reserved: i16) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn with_capver(mut self, capver: u8) -> Self {
        self.capver = capver;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Client connection to an xproofd daemon
pub struct Connection {
    addr: String,
    state: ConnectionState,
    stream_id: StreamId,
    request_timeout: Duration,
    server_version: Option<i32>,
    tx: mpsc::Sender<Request>,
    rx: mpsc::Receiver<Response>,
    /// Unsolicited messages received while waiting for a reply
    pending_attn: VecDeque<Response>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Connection {
    /// Create a new connection (not yet connected)
    pub fn new(addr: impl Into<String>) -> Self {
        let (tx, _) = mpsc::channel(1);
        let (_, rx) = mpsc::channel(1);
        Self {
            addr: addr.into(),
            state: ConnectionState::Disconnected,
            stream_id: StreamId::from_u16(1),
            request_timeout: Duration::from_secs(30),
            server_version: None,
            tx,
            rx,
            pending_attn: VecDeque::new(),
            task_handle: None,
        }
    }

    /// Set the time to wait for each reply
    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Daemon version received in the handshake
    pub fn server_version(&self) -> Option<i32> {
        self.server_version
    }

    /// True while the socket task is alive
    pub fn is_valid(&self) -> bool {
        self.state == ConnectionState::Connected
            && self
                .task_handle
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }

    /// Connect and perform the handshake
    pub async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        let stream: Box<dyn StreamTrait> = match DaemonAddr::parse(&self.addr)? {
            DaemonAddr::Tcp { host, port, .. } => {
                let target = format!("{}:{}", host, port);
                let connect = timeout(self.request_timeout, TcpStream::connect(&target));
                let tcp = connect
                    .await
                    .map_err(|_| XpdError::ConnectionTimeout {
                        seconds: self.request_timeout.as_secs(),
                    })?
                    .map_err(|e| XpdError::connection(format!("Failed to connect to {}: {}", target, e)))?;
                Box::new(tcp)
            }
            DaemonAddr::Unix(path) => {
                let unix = UnixStream::connect(&path).await.map_err(|e| {
                    XpdError::connection(format!("Failed to connect to {}: {}", path.display(), e))
                })?;
                Box::new(unix)
            }
        };

        self.attach_stream(stream).await
    }

    /// Use an already connected stream
    pub async fn attach_stream(&mut self, mut stream: Box<dyn StreamTrait>) -> Result<()> {
        let version = initiate_handshake(&mut stream, self.request_timeout)
            .await
            .map_err(|e| XpdError::Handshake(e.to_string()))?;
        self.server_version = Some(version);

        let framed = Framed::new(stream, ClientCodec::new());
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Request>(100);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Response>(100);
        self.tx = outgoing_tx;
        self.rx = incoming_rx;

        let handle = tokio::spawn(Self::connection_task(framed, outgoing_rx, incoming_tx));
        self.task_handle = Some(handle);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Disconnect from the daemon
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Send a request without waiting for the reply
    pub async fn send(&self, req: Request) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(XpdError::connection("Not connected"));
        }
        self.tx.send(req).await.map_err(|_| XpdError::ConnectionClosed)
    }

    /// Receive the next message, bounded by the request timeout
    pub async fn recv(&mut self) -> Result<Response> {
        match timeout(self.request_timeout, self.rx.recv()).await {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) => Err(XpdError::ConnectionClosed),
            Err(_) => Err(XpdError::ConnectionTimeout {
                seconds: self.request_timeout.as_secs(),
            }),
        }
    }

    /// Next unsolicited message: a buffered one first, else from the socket
    pub async fn next_attn(&mut self) -> Result<Response> {
        if let Some(resp) = self.pending_attn.pop_front() {
            return Ok(resp);
        }
        loop {
            let resp = self.recv().await?;
            if resp.is_attn() {
                return Ok(resp);
            }
            tracing::debug!(status = ?resp.status, "Dropping reply while waiting for attn");
        }
    }

    /// Messages buffered so far, without waiting
    pub fn drain_attn(&mut self) -> Vec<Response> {
        self.pending_attn.drain(..).collect()
    }

    /// Send a request and wait for its final reply.
    ///
    /// Unsolicited messages arriving meanwhile are buffered; partial
    /// (`OkSoFar`) replies are concatenated.
    pub async fn request(&mut self, req: Request) -> Result<Response> {
        self.send(req).await?;
        let mut partial = BytesMut::new();
        loop {
            let resp = self.recv().await?;
            match resp.status {
                ResponseStatus::Attn => self.pending_attn.push_back(resp),
                ResponseStatus::OkSoFar => partial.extend_from_slice(&resp.body),
                ResponseStatus::Ok if !partial.is_empty() => {
                    partial.extend_from_slice(&resp.body);
                    return Ok(Response {
                        body: partial.freeze(),
                        ..resp
                    });
                }
                _ => return Ok(resp),
            }
        }
    }

    /// Like [`request`](Self::request) but maps an error reply to `XpdError::Remote`
    pub async fn request_ok(&mut self, req: Request) -> Result<Response> {
        let resp = self.request(req).await?;
        match resp.error_info() {
            Some((code, message)) => Err(XpdError::Remote { code, message }),
            None => Ok(resp),
        }
    }

    fn build(&self, id: RequestId, body: [u8; 16], payload: impl Into<Bytes>) -> Request {
        Request::new(self.stream_id, id, body, payload)
    }

    // === Typed requests ===

    /// Log in; returns the first reply (carries the daemon version)
    pub async fn login(&mut self, params: &LoginParams) -> Result<Response> {
        let body = LoginBody::new(
            std::process::id() as i32,
            &params.user,
            params.role,
            params.capver,
            params.reserved,
        );
        let req = self.build(RequestId::Login, body.encode(), params.payload.clone());
        self.request_ok(req).await
    }

    /// Admin request of the given type
    pub async fn admin(
        &mut self,
        kind: AdminType,
        sid: i32,
        int2: i32,
        payload: impl Into<Bytes>,
    ) -> Result<Response> {
        let body = ProofBody {
            sid,
            int1: kind.as_i32(),
            int2,
            int3: 0,
        };
        let req = self.build(RequestId::Admin, body.encode(), payload);
        self.request_ok(req).await
    }

    /// Session request with the generic body
    pub async fn proof_request(
        &mut self,
        id: RequestId,
        body: ProofBody,
        payload: impl Into<Bytes>,
    ) -> Result<Response> {
        let req = self.build(id, body.encode(), payload);
        self.request(req).await
    }

    /// Forward a message through the daemon
    pub async fn send_msg(&mut self, body: SendRcvBody, payload: impl Into<Bytes>) -> Result<Response> {
        let req = self.build(RequestId::SendMsg, body.encode(), payload);
        self.request(req).await
    }

    /// Ping a session (or the daemon with `sid < 0`)
    pub async fn ping(&mut self, body: SendRcvBody) -> Result<Response> {
        let req = self.build(RequestId::Ping, body.encode(), Bytes::new());
        self.request(req).await
    }

    /// Read a piece of a file known to the daemon
    pub async fn read_buffer(&mut self, body: ReadBufBody, payload: impl Into<Bytes>) -> Result<Response> {
        let req = self.build(RequestId::ReadBuf, body.encode(), payload);
        self.request(req).await
    }

    /// Background task that handles the actual socket I/O
    async fn connection_task(
        mut framed: Framed<Box<dyn StreamTrait>, ClientCodec>,
        mut outgoing: mpsc::Receiver<Request>,
        incoming: mpsc::Sender<Response>,
    ) {
        loop {
            tokio::select! {
                Some(req) = outgoing.recv() => {
                    if let Err(e) = framed.send(req).await {
                        tracing::error!("Failed to send request: {}", e);
                        break;
                    }
                }

                result = framed.next() => {
                    match result {
                        Some(Ok(resp)) => {
                            if incoming.send(resp).await.is_err() {
                                tracing::debug!("Incoming channel closed, receiver dropped");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("Failed to receive response: {}", e);
                            break;
                        }
                        None => {
                            tracing::debug!("Daemon closed connection");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
