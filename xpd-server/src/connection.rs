//! Per-connection tasks
//!
//! Every accepted stream (TCP from clients and peers, UNIX from spawned
//! session processes) goes through the same steps: opening handshake,
//! then a read loop feeding [`ConnectionContext::route_request`] while a
//! writer task drains the connection's [`Link`] queue.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use xpd_protocol::handshake::accept_handshake;
use xpd_protocol::{CodecError, ErrorCode, Response, ServerCodec, StreamId, DAEMON_VERSION};

use crate::client::ClientSession;
use crate::handlers::{ConnectionContext, HandlerResult, Reply};
use crate::link::Link;
use crate::state::SharedState;

/// Serve a client or peer connection until it closes
#[instrument(skip(stream, state))]
pub async fn handle_client<S>(stream: S, peer_host: String, state: SharedState)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (link, outgoing) = Link::channel(peer_host.clone());
    let ctx = ConnectionContext::new(state, link, peer_host);
    serve(stream, ctx, outgoing).await;
}

/// Serve a session-process callback accepted on `owner`'s socket
pub fn spawn_callback(stream: UnixStream, state: SharedState, owner: Arc<ClientSession>) {
    tokio::spawn(callback_task(stream, state, owner));
}

// Boxed: Create awaits the launch that spawns this task
fn callback_task(stream: UnixStream, state: SharedState, owner: Arc<ClientSession>) -> BoxFuture<'static, ()> {
    async move {
        let (link, outgoing) = Link::channel("localhost");
        debug!("callback connection for {} on link {}", owner.user(), link.id());
        let ctx = ConnectionContext::for_callback(state, link, owner);
        serve(stream, ctx, outgoing).await;
    }
    .boxed()
}

async fn serve<S>(mut stream: S, mut ctx: ConnectionContext, mut outgoing: mpsc::Receiver<Response>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let link = Arc::clone(ctx.link());
    let readwait = ctx.state().config().readwait;
    if let Err(e) = accept_handshake(&mut stream, readwait, DAEMON_VERSION).await {
        info!("handshake with {} failed: {}", link.peer(), e);
        return;
    }

    let (mut sink, mut requests) = Framed::new(stream, ServerCodec::new()).split();
    let closed = link.closed_token();

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = outgoing.recv() => {
                    let Some(resp) = msg else { break };
                    if let Err(e) = sink.send(resp).await {
                        debug!("write failed: {}", e);
                        break;
                    }
                }
                _ = writer_closed.cancelled() => {
                    // Flush what was queued before the close
                    while let Ok(resp) = outgoing.try_recv() {
                        if sink.send(resp).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let next = tokio::select! {
            next = requests.next() => next,
            _ = closed.cancelled() => break,
        };
        match next {
            Some(Ok(req)) => {
                let stream_id = req.stream_id;
                let result = ctx.route_request(req).await;
                if !write_reply(&link, stream_id, result).await {
                    break;
                }
            }
            Some(Err(CodecError::NegativeLength { stream_id, dlen })) => {
                warn!("{}: negative data length {}", link.peer(), dlen);
                let resp = Response::error(ErrorCode::ArgInvalid, "Invalid request: negative data length");
                link.send(resp.on_stream(stream_id)).await;
                break;
            }
            Some(Err(e)) => {
                debug!("{}: read failed: {}", link.peer(), e);
                break;
            }
            None => {
                debug!("{} closed the connection", link.peer());
                break;
            }
        }
    }

    link.close();
    ctx.recycle().await;
    if let Err(e) = writer.await {
        debug!("writer task: {}", e);
    }
}

/// Queue the outcome of a request; false once the link must go down
async fn write_reply(link: &Link, stream_id: StreamId, result: HandlerResult) -> bool {
    match result {
        Ok(Reply::Response(resp)) => link.send(resp.on_stream(stream_id)).await,
        Ok(Reply::Responses(resps)) => {
            for resp in resps {
                if !link.send(resp.on_stream(stream_id)).await {
                    return false;
                }
            }
            true
        }
        Ok(Reply::None) => !link.is_closed(),
        Err(e) => {
            debug!("request from {} failed: {}", link.peer(), e);
            let sent = link.send(e.to_response().on_stream(stream_id)).await;
            sent && !e.close
        }
    }
}
