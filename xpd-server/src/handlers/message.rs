//! Message forwarding handlers
//!
//! Handles: SendMsg, Urgent, Interrupt, Ping
//!
//! External requests come from clients and go down the back-channel of
//! the session; internal ones come from the session process and go up to
//! the attached clients.

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use xpd_protocol::{ActionCode, Request, Response, SendMsgOptions};

use super::{ConnectionContext, HandlerResult, RequestError};

impl ConnectionContext {
    pub(super) async fn handle_send_msg(&mut self, req: &Request) -> HandlerResult {
        let body = req.sendrcv();
        let session = self.session_or(body.sid, "session ID not found")?;
        let mut opt = SendMsgOptions(body.opt);
        let payload = req.payload.clone();
        debug!(
            "sendmsg: psid {}, status {}, cid {}, {} bytes",
            body.sid,
            session.status().label(),
            self.cid,
            payload.len()
        );

        if !opt.contains(SendMsgOptions::INTERNAL) {
            if opt.contains(SendMsgOptions::PROCESS) {
                debug!("sendmsg: session {} now running", body.sid);
                self.state.session_running(&session);
            }
            if self.cid < 0 {
                return Err(RequestError::server("EXT: getting clientSID"));
            }
            let delivered = match session.back_channel() {
                Some(ch) => ch.send_msgsid(self.cid, &payload).await,
                None => false,
            };
            if !delivered {
                return Err(RequestError::server("EXT: sending message to proofserv"));
            }
            return Ok(Response::ok().into());
        }

        let mut save_start = false;
        if opt.contains(SendMsgOptions::SETIDLE) {
            self.state.session_idle(&session);
            session.with(|st| st.start_msg = None);
        } else if opt.contains(SendMsgOptions::QUERYNUM) {
            session.with(|st| st.query_num = Some(payload.clone()));
        } else if opt.contains(SendMsgOptions::STARTPROCESS) {
            self.state.session_running(&session);
            session.with(|st| st.start_msg = None);
            save_start = true;
        } else if opt.contains(SendMsgOptions::LOGMSG)
            && session.status() == crate::session::SessionStatus::Running
        {
            opt = opt.with(SendMsgOptions::FB_PROG);
        }

        const FAILED: &str = "SendMsg: INT: sending message to client or master proofserv";
        if !opt.contains(SendMsgOptions::FB_PROG) {
            if !session.has_client_slot(body.cid) {
                return Err(RequestError::invalid("Client ID not found"));
            }
            let Some(client) = session.attached(body.cid) else {
                debug!("sendmsg: client {} not connected", body.cid);
                return Ok(Response::ok().into());
            };
            if !client.send_msg(ActionCode::Msg, &payload).await {
                return Err(RequestError::server(FAILED));
            }
        } else {
            for (cid, client) in session.clients() {
                if !client.send_msg(ActionCode::Msg, &payload).await {
                    warn!("sendmsg: broadcast to client {} failed", cid);
                    return Err(RequestError::server(FAILED));
                }
            }
        }
        if save_start {
            session.with(|st| st.start_msg = Some(payload));
        }
        Ok(Response::ok().into())
    }

    pub(super) async fn handle_urgent(&mut self, req: &Request) -> HandlerResult {
        let body = req.proof();
        let session = self.session_or(body.sid, "Urgent: session ID not found")?;
        let mut buf = BytesMut::with_capacity(12);
        buf.put_i32(body.int1);
        buf.put_i32(body.int2);
        buf.put_i32(body.int3);

        let delivered = match session.back_channel() {
            Some(ch) => ch.send(Response::attn(ActionCode::Urgent, &buf)).await,
            None => false,
        };
        if !delivered {
            return Err(RequestError::server("Urgent: could not propagate request to proofsrv"));
        }
        debug!("urgent {} propagated to session {}", body.int1, body.sid);
        Ok(Response::ok().into())
    }

    pub(super) async fn handle_interrupt(&mut self, req: &Request) -> HandlerResult {
        let body = req.interrupt();
        let session = self.session_or(body.sid, "session ID not found")?;
        let delivered = match session.back_channel() {
            Some(ch) => ch.send(Response::attn_info(ActionCode::Interrupt, body.kind)).await,
            None => false,
        };
        if !delivered {
            return Err(RequestError::server(
                "Interrupt: could not propagate interrupt code to proofsrv",
            ));
        }
        Ok(Response::ok().into())
    }

    pub(super) async fn handle_ping(&mut self, req: &Request) -> HandlerResult {
        let body = req.sendrcv();
        let session = self.session_or(body.sid, "session ID not found")?;

        if SendMsgOptions(body.opt).contains(SendMsgOptions::INTERNAL) {
            session.ping_acked();
            return Ok(Response::ok_int(1).into());
        }

        let acked = session.ping_waiter();
        tokio::pin!(acked);
        acked.as_mut().enable();
        let sent = match session.back_channel() {
            Some(ch) => ch.send(Response::attn(ActionCode::Ping, &[])).await,
            None => false,
        };
        if !sent {
            return Err(RequestError::server("EXT: could not verify proofsrv"));
        }
        let wait = self.state.config().intwait;
        let alive = tokio::time::timeout(wait, acked).await.is_ok();
        debug!("ping of session {}: {}", body.sid, if alive { "alive" } else { "no answer" });
        Ok(Response::ok_int(i32::from(alive)).into())
    }
}
