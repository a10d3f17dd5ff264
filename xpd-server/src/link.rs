//! Connection output handles
//!
//! A [`Link`] is the write side of one peer connection: responses are
//! queued on a channel drained by the connection's writer task, so any
//! handler (or another connection forwarding a message) can address it
//! without touching the socket. A [`Responder`] pins a link to a stream id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use xpd_protocol::{split_payload, ActionCode, Response, StreamId};

/// Identifier of a link, unique for the daemon lifetime
pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Output queue capacity per link
pub const LINK_QUEUE: usize = 256;

/// Write side of a peer connection
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    peer: String,
    tx: mpsc::Sender<Response>,
    closed: CancellationToken,
}

impl Link {
    pub fn new(peer: impl Into<String>, tx: mpsc::Sender<Response>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            tx,
            closed: CancellationToken::new(),
        })
    }

    /// Link plus the receiver its writer task drains
    pub fn channel(peer: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel(LINK_QUEUE);
        (Self::new(peer, tx), rx)
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Host name (or socket path) of the peer
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a response; false if the link is gone
    pub async fn send(&self, resp: Response) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(resp).await.is_ok()
    }

    /// Queue without waiting; false if the link is gone or saturated
    pub fn try_send(&self, resp: Response) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(resp) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Link {} ({}) output queue full", self.id, self.peer);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection serving this link to shut down
    pub fn close(&self) {
        debug!("Closing link {} ({})", self.id, self.peer);
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Token cancelled when the link is closed
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// A link addressed on one stream
#[derive(Debug, Clone)]
pub struct Responder {
    link: Arc<Link>,
    stream_id: StreamId,
}

impl Responder {
    pub fn new(link: Arc<Link>, stream_id: StreamId) -> Self {
        Self { link, stream_id }
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub async fn send(&self, resp: Response) -> bool {
        self.link.send(resp.on_stream(self.stream_id)).await
    }

    pub fn try_send(&self, resp: Response) -> bool {
        self.link.try_send(resp.on_stream(self.stream_id))
    }

    /// Attn message split into bounded chunks
    pub async fn send_msg(&self, action: ActionCode, data: &[u8]) -> bool {
        for chunk in split_payload(data) {
            if !self.send(Response::attn(action, chunk)).await {
                return false;
            }
        }
        true
    }

    /// Message forwarded on behalf of client `cid`, chunked
    pub async fn send_msgsid(&self, cid: i32, data: &[u8]) -> bool {
        for chunk in split_payload(data) {
            if !self.send(Response::attn_msgsid(cid, chunk)).await {
                return false;
            }
        }
        true
    }
}
