//! Request handlers
//!
//! A [`ConnectionContext`] carries the protocol state of one connection
//! (login progress, bound client, client id, bound session for callbacks)
//! and routes every decoded request to its handler. Handlers answer with a
//! [`Reply`] or a [`RequestError`]; the connection task writes either out.

mod admin;
mod login;
mod message;
mod readbuf;
mod session;

pub(crate) use session::terminate_session;

use std::sync::Arc;

use tracing::{debug, warn};

use xpd_protocol::{ErrorCode, Request, RequestId, Response, Role, StreamId};

use crate::client::ClientSession;
use crate::identity::UserIdentity;
use crate::link::{Link, Responder};
use crate::session::SessionProxy;
use crate::state::SharedState;

/// Login progress of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    Anonymous,
    /// Login accepted, credential rounds in progress
    Authenticating,
    /// Credentials accepted, waiting for the mapping login
    Authenticated,
    LoggedIn,
}

/// What a handler sends back on the request stream
#[derive(Debug)]
pub enum Reply {
    Response(Response),
    /// Several responses, written in order
    Responses(Vec<Response>),
    /// Already answered (or nothing to say)
    None,
}

impl From<Response> for Reply {
    fn from(resp: Response) -> Self {
        Reply::Response(resp)
    }
}

/// A failed request: answered with an error response, the link is closed
/// afterwards when `close` is set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
    pub close: bool,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            close: false,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }

    /// Close the link once the error is sent
    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn to_response(&self) -> Response {
        Response::error(self.code, &self.message)
    }
}

pub type HandlerResult = Result<Reply, RequestError>;

/// Login parameters kept between the login and the mapping step
#[derive(Debug, Clone)]
struct PendingLogin {
    identity: UserIdentity,
    group: String,
    /// Client version (external) or target session id (internal)
    reserved: i16,
    capver: u8,
}

/// Protocol state of one connection
pub struct ConnectionContext {
    state: SharedState,
    link: Arc<Link>,
    /// Host name of the peer; `localhost` for callback sockets
    peer_host: String,
    /// Stream of the request being handled
    stream_id: StreamId,
    status: LoginStatus,
    role: Option<Role>,
    pending: Option<PendingLogin>,
    client: Option<Arc<ClientSession>>,
    /// Index of this connection in the client's connection table
    cid: i32,
    /// Session whose back-channel this connection is (internal logins)
    internal: Option<Arc<SessionProxy>>,
    /// Client whose callback socket accepted this connection
    callback_owner: Option<Arc<ClientSession>>,
    superuser: bool,
    credentials: Option<Vec<u8>>,
}

impl ConnectionContext {
    pub fn new(state: SharedState, link: Arc<Link>, peer_host: impl Into<String>) -> Self {
        Self {
            state,
            link,
            peer_host: peer_host.into(),
            stream_id: StreamId::default(),
            status: LoginStatus::Anonymous,
            role: None,
            pending: None,
            client: None,
            cid: -1,
            internal: None,
            callback_owner: None,
            superuser: false,
            credentials: None,
        }
    }

    /// Connection accepted on the callback socket of `owner`
    pub fn for_callback(state: SharedState, link: Arc<Link>, owner: Arc<ClientSession>) -> Self {
        let mut ctx = Self::new(state, link, "localhost");
        ctx.callback_owner = Some(owner);
        ctx
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn status(&self) -> LoginStatus {
        self.status
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn client(&self) -> Option<&Arc<ClientSession>> {
        self.client.as_ref()
    }

    pub fn cid(&self) -> i32 {
        self.cid
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Responder addressing the stream of the current request
    fn responder(&self) -> Responder {
        Responder::new(Arc::clone(&self.link), self.stream_id)
    }

    /// Send `resp` on the current stream now, ahead of the final reply
    async fn send_now(&self, resp: Response) -> bool {
        self.link.send(resp.on_stream(self.stream_id)).await
    }

    /// Client bound by the login; every post-login request needs one
    fn bound_client(&self) -> Result<Arc<ClientSession>, RequestError> {
        self.client
            .clone()
            .ok_or_else(|| RequestError::invalid("client not mapped"))
    }

    /// Valid session `psid` of the bound client
    fn session_or(&self, psid: i32, message: &str) -> Result<Arc<SessionProxy>, RequestError> {
        self.bound_client()?
            .session(psid)
            .ok_or_else(|| RequestError::invalid(message))
    }

    // ==================== Dispatch ====================

    /// Route a request to its handler
    pub async fn route_request(&mut self, req: Request) -> HandlerResult {
        self.stream_id = req.stream_id;
        let id = match req.id() {
            Ok(id) => id,
            Err(raw) => {
                warn!("unknown request id {} from {}", raw, self.link.peer());
                if self.status != LoginStatus::LoggedIn {
                    return Err(RequestError::invalid("Invalid request; user not logged in").closing());
                }
                return Err(RequestError::invalid(format!("Invalid request code: {}", raw)));
            }
        };
        debug!("{} request on link {} ({})", id, self.link.id(), self.link.peer());

        if self.status != LoginStatus::LoggedIn {
            return match id {
                RequestId::Login => self.handle_login(&req).await,
                RequestId::Auth => self.handle_auth(&req).await,
                _ => Err(RequestError::invalid("Invalid request; user not logged in").closing()),
            };
        }

        if self.role == Some(Role::Admin)
            && matches!(
                id,
                RequestId::Create | RequestId::Destroy | RequestId::Attach | RequestId::Detach | RequestId::Interrupt
            )
        {
            return Err(RequestError::invalid(format!(
                "Invalid request code: 'admin' role not allowd to process '{}'",
                id.name()
            )));
        }

        match id {
            RequestId::Login => self.handle_login(&req).await,
            RequestId::Auth => self.handle_auth(&req).await,
            RequestId::Create => self.handle_create(&req).await,
            RequestId::Destroy => self.handle_destroy(&req).await,
            RequestId::Attach => self.handle_attach(&req).await,
            RequestId::Detach => self.handle_detach(&req).await,
            RequestId::SendMsg => self.handle_send_msg(&req).await,
            RequestId::Admin => self.handle_admin(&req).await,
            RequestId::Interrupt => self.handle_interrupt(&req).await,
            RequestId::Ping => self.handle_ping(&req).await,
            RequestId::Urgent => self.handle_urgent(&req).await,
            RequestId::ReadBuf => self.handle_read_buffer(&req).await,
            RequestId::Cleanup => Err(RequestError::invalid(format!(
                "Invalid request code: {}",
                id.as_u16()
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use crate::state::DaemonState;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use xpd_protocol::{LoginBody, ProofBody};

    /// Context over a fresh link, plus the receiver of everything sent on it
    pub(crate) fn create_test_context(state: &SharedState) -> (ConnectionContext, mpsc::Receiver<Response>) {
        let (link, rx) = Link::channel("lxb02.example.org");
        (ConnectionContext::new(Arc::clone(state), link, "lxb02.example.org"), rx)
    }

    pub(crate) fn shared(root: &TempDir) -> SharedState {
        Arc::new(test_state(root))
    }

    pub(crate) fn login_request(user: &str, role: Role, reserved: i16, capver: u8) -> Request {
        let body = LoginBody::new(4242, user, role, capver, reserved);
        Request::new(StreamId::from_u16(1), RequestId::Login, body.encode(), Vec::new())
    }

    pub(crate) fn proof_request(id: RequestId, body: ProofBody, payload: &[u8]) -> Request {
        Request::new(StreamId::from_u16(1), id, body.encode(), payload.to_vec())
    }

    /// Context logged in as `user` with `role`
    pub(crate) async fn logged_in(state: &SharedState, user: &str, role: Role) -> (ConnectionContext, mpsc::Receiver<Response>) {
        let (mut ctx, rx) = create_test_context(state);
        let reply = ctx.route_request(login_request(user, role, 16, 16)).await;
        assert!(matches!(reply, Ok(Reply::Response(ref r)) if r.is_ok()), "login failed: {:?}", reply);
        (ctx, rx)
    }

    pub(crate) fn expect_error(result: HandlerResult) -> RequestError {
        match result {
            Err(e) => e,
            Ok(reply) => panic!("Expected error, got {:?}", reply),
        }
    }

    pub(crate) fn expect_response(result: HandlerResult) -> Response {
        match result {
            Ok(Reply::Response(resp)) => resp,
            other => panic!("Expected response, got {:?}", other),
        }
    }

    // ==================== Dispatch Tests ====================

    #[tokio::test]
    async fn test_requests_before_login_close_link() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = create_test_context(&state);
        let err = expect_error(
            ctx.route_request(proof_request(RequestId::Create, ProofBody::default(), b""))
                .await,
        );
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(err.message, "Invalid request; user not logged in");
        assert!(err.close);
    }

    #[tokio::test]
    async fn test_admin_role_barred_from_session_requests() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = logged_in(&state, "alice", Role::Admin).await;
        for id in [RequestId::Create, RequestId::Destroy, RequestId::Attach, RequestId::Detach, RequestId::Interrupt] {
            let err = expect_error(ctx.route_request(proof_request(id, ProofBody::default(), b"")).await);
            assert_eq!(
                err.message,
                format!("Invalid request code: 'admin' role not allowd to process '{}'", id.name())
            );
            assert!(!err.close);
        }
    }

    #[tokio::test]
    async fn test_unknown_request_id() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let mut req = proof_request(RequestId::Ping, ProofBody::default(), b"");
        req.request_id = 3999;
        let err = expect_error(ctx.route_request(req).await);
        assert_eq!(err.message, "Invalid request code: 3999");
        assert!(!err.close);

        let err = expect_error(
            ctx.route_request(proof_request(RequestId::Cleanup, ProofBody::default(), b""))
                .await,
        );
        assert_eq!(err.message, "Invalid request code: 3111");
    }

    #[test]
    fn test_request_error_response() {
        let err = RequestError::new(ErrorCode::NotFound, "gone");
        assert!(!err.close);
        assert_eq!(err.to_response().error_info(), Some((ErrorCode::NotFound.as_i32(), "gone".to_string())));
    }

    #[test]
    fn test_state_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DaemonState>();
    }
}
