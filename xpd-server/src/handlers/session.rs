//! Session-related message handlers
//!
//! Handles: Create, Destroy, Attach, Detach, plus the cleanup run when a
//! connection goes away.

use std::sync::Arc;

use tracing::{debug, info, warn};

use xpd_protocol::{ActionCode, Request, Response, Role, DAEMON_VERSION};

use crate::client::{tag_from_log_path, ClientSession};
use crate::connection;
use crate::launcher::{resolve_keywords, LaunchPlan};
use crate::session::{SessionProxy, SessionStatus};
use crate::state::DaemonState;

use super::{ConnectionContext, HandlerResult, Reply, RequestError};

/// Fields of a Create payload: `<tag>[|ord:<o>][|cf:<file>][|envs:<A=1,B=2>]`
#[derive(Debug, Clone, PartialEq, Eq)]
struct CreateRequest {
    tag: String,
    ordinal: String,
    cfg_file: Option<String>,
    user_envs: String,
}

impl CreateRequest {
    fn parse(payload: &str, role: Role) -> Self {
        let field = |key: &str| {
            payload
                .find(key)
                .map(|at| payload[at + key.len()..].split('|').next().unwrap_or("").to_string())
        };
        let ordinal = if matches!(role, Role::Worker | Role::SubMaster) {
            field("|ord:").unwrap_or_else(|| "0".to_string())
        } else {
            "0".to_string()
        };
        Self {
            tag: payload.split('|').next().unwrap_or("").to_string(),
            ordinal,
            cfg_file: field("|cf:").filter(|c| !c.is_empty()),
            user_envs: field("|envs:").unwrap_or_default(),
        }
    }
}

/// Tag under which a session is recorded in the sandbox ledger
fn ledger_tag(session: &SessionProxy) -> String {
    session.with(|st| {
        st.log_file
            .as_deref()
            .and_then(tag_from_log_path)
            .unwrap_or_else(|| st.tag.clone())
    })
}

/// Stop the process of `session` and free its slot
pub(crate) fn terminate_session(state: &DaemonState, client: &ClientSession, session: &SessionProxy) {
    if let Some(pid) = session.pid() {
        if !state.supervisor.terminate(pid, session.back_channel()) {
            debug!("session {}: process {} already gone", session.id(), pid);
        }
    }
    if session.role() != Role::Internal {
        if let Err(e) = client.sandbox().remove_session(&ledger_tag(session)) {
            debug!("{}: cannot update session ledger: {}", client.user(), e);
        }
    }
    state.invalidate_session(session);
}

/// Whether the shutdown policy `opt` applies to a session in `status`
fn shutdown_applies(opt: i32, status: SessionStatus) -> bool {
    match opt {
        0 => false,
        1 => status == SessionStatus::Idle,
        _ => true,
    }
}

impl ConnectionContext {
    pub(super) async fn handle_create(&mut self, req: &Request) -> HandlerResult {
        let client = self.bound_client()?;
        let role = self.role.unwrap_or(Role::TopMaster);
        let cfg = self.state.config();
        let body = req.proof();
        let create = CreateRequest::parse(&req.payload_str(), role);

        let runtime = client
            .runtime_tag()
            .and_then(|tag| self.state.versions.get(&tag))
            .or_else(|| self.state.versions.default_version())
            .ok_or_else(|| RequestError::server("Create: no ROOT version available"))?;

        let session = client.allocate_session(role);
        session.attach(self.cid, self.responder());
        session.with(|st| {
            st.tag = create.tag.clone();
            st.ordinal = create.ordinal.clone();
            st.user_envs = create.user_envs.clone();
            st.runtime_tag = runtime.tag.clone();
            st.client_version = client.version();
            st.priority_delta = cfg.priority_delta(client.user());
        });
        debug!(
            "create: ord {}, cfg {:?}, psid {}, cid {}, log {}",
            create.ordinal,
            create.cfg_file,
            session.id(),
            self.cid,
            body.int1
        );

        if role == Role::TopMaster {
            let is_default = self
                .state
                .versions
                .default_version()
                .is_some_and(|d| d.tag == runtime.tag);
            if !is_default {
                let msg = format!("++++ Using NON-default ROOT version: {} ++++\n", runtime.export());
                self.send_now(Response::attn_text(ActionCode::SrvMsg, &msg)).await;
            }
        }

        let sandbox = client.sandbox().clone();
        let group = client.group();
        let entity = format!("{}:{}@{}", client.user(), group, self.peer_host);
        let plan = LaunchPlan {
            user: client.identity().clone(),
            group,
            role,
            psid: session.id(),
            cid: self.cid,
            ordinal: create.ordinal,
            tag: create.tag,
            log_level: body.int1,
            cfg_file: create.cfg_file,
            user_envs: create.user_envs,
            runtime: runtime.clone(),
            client_version: client.version(),
            sock_path: client.sock_path().to_path_buf(),
            entity,
            host: cfg.host.clone(),
            daemon_pid: std::process::id(),
            daemon_port: cfg.port,
            tmp_dir: cfg.tmp_dir.clone(),
            dataset_dir: cfg.dataset_dir.clone(),
            config_file: cfg.source.clone(),
            use_user_cfg: cfg.resource.user_cfg,
            putenv: cfg
                .putenv
                .iter()
                .map(|v| resolve_keywords(v, sandbox.dir(), &cfg.host, client.user()))
                .collect(),
            putrc: cfg.putrc.clone(),
            change_owner: self.state.identities.can_change_owner(),
            credentials: self.credentials.clone(),
            sandbox,
        };

        let state = Arc::clone(&self.state);
        let owner = Arc::clone(&client);
        let launched = self
            .state
            .supervisor
            .launch(plan, &client, &session, cfg.intwait, move |stream| {
                connection::spawn_callback(stream, state, owner)
            })
            .await;

        let extra = (role == Role::TopMaster).then(|| cfg.pool_location());
        let reply = Response::ok_session(session.id(), runtime.srv_proto as i16, DAEMON_VERSION as i16, extra.as_deref());
        let ack = match launched {
            Ok(ack) => ack,
            Err(e) if e.is_setup_failure() => {
                warn!("create for {} failed: {}", client.user(), e);
                self.state.invalidate_session(&session);
                return Err(RequestError::server(e.reason));
            }
            Err(e) => {
                warn!("session {} of {} lost: {}", session.id(), client.user(), e);
                self.state.invalidate_session(&session);
                return Ok(Reply::Responses(vec![
                    reply,
                    Response::attn_text(ActionCode::ErrMsg, &e.reason),
                ]));
            }
        };

        let tag = tag_from_log_path(&ack.log_file).unwrap_or(ack.tag);
        session.with(|st| {
            st.tag = tag.clone();
            st.work_dir = ack.log_file.parent().map(|p| p.to_path_buf());
            st.group = client.group();
        });
        if let Some(delta) = session.with(|st| st.priority_delta) {
            match crate::launcher::process::renice(ack.pid, delta) {
                Ok(()) => debug!("priority of {} changed by {} units", ack.pid, delta),
                Err(e) => warn!("cannot change priority of {}: {}", ack.pid, e),
            }
        }
        if role != Role::Internal {
            if let Err(e) = client.sandbox().add_session(&tag) {
                warn!("{}: problems recording session in sandbox: {}", client.user(), e);
            }
        }
        info!("session {} ({}) created for {}", session.id(), tag, client.user());
        Ok(reply.into())
    }

    pub(super) async fn handle_destroy(&mut self, req: &Request) -> HandlerResult {
        let client = self.bound_client()?;
        let psid = req.proof().sid;
        let targets = if psid > -1 {
            vec![client
                .session(psid)
                .ok_or_else(|| RequestError::invalid("reference session ID not found"))?]
        } else {
            client.sessions()
        };

        let top_caller = self.role == Some(Role::TopMaster);
        for session in targets {
            if session.role() == Role::TopMaster && top_caller {
                let msg = format!(
                    "Destroy: session: {} destroyed by: {}",
                    session.tag(),
                    self.link.peer()
                );
                session.notify_clients(ActionCode::SrvMsg, &msg, Some(self.link.id()));
            }
            debug!("destroy: session {} (pid {:?})", session.id(), session.pid());
            terminate_session(&self.state, &client, &session);
        }
        Ok(Response::ok().into())
    }

    pub(super) async fn handle_attach(&mut self, req: &Request) -> HandlerResult {
        let psid = req.proof().sid;
        let session = self.session_or(psid, "session ID not found")?;
        session.attach(self.cid, self.responder());

        let cfg = self.state.config();
        let (srv_proto, query_num, start_msg) = session.with(|st| {
            let proto = self
                .state
                .versions
                .get(&st.runtime_tag)
                .map(|v| v.srv_proto)
                .unwrap_or(st.srv_proto);
            let start = (st.status == SessionStatus::Running)
                .then(|| st.start_msg.clone())
                .flatten();
            (proto, st.query_num.clone(), start)
        });
        let extra = (self.role == Some(Role::TopMaster)).then(|| cfg.pool_location());

        let mut replies = vec![Response::ok_session(
            psid,
            srv_proto as i16,
            DAEMON_VERSION as i16,
            extra.as_deref(),
        )];
        if let Some(msg) = query_num {
            replies.push(Response::attn(ActionCode::Msg, &msg));
        }
        if let Some(msg) = start_msg {
            replies.push(Response::attn(ActionCode::Msg, &msg));
        }
        Ok(Reply::Responses(replies))
    }

    pub(super) async fn handle_detach(&mut self, req: &Request) -> HandlerResult {
        let psid = req.proof().sid;
        let session = self.session_or(psid, "session ID not found")?;
        if !session.detach(self.cid) {
            debug!("detach: client {} was not attached to {}", self.cid, psid);
        }
        Ok(Response::ok().into())
    }

    // ==================== Recycle ====================

    /// Clean up after the connection closed
    pub async fn recycle(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        if let Some(session) = self.internal.take() {
            if session.clear_back_channel(self.link.id()) && session.is_valid() {
                let msg = format!("Recycle: session: {} terminated by peer", session.tag());
                session.notify_clients(ActionCode::ErrMsg, &msg, None);
                if let Some(pid) = session.pid() {
                    if let Err(e) = self.state.supervisor.kill(pid, true) {
                        debug!("recycle: kill {}: {}", pid, e);
                    }
                }
                if let Err(e) = client.sandbox().remove_session(&ledger_tag(&session)) {
                    debug!("{}: cannot update session ledger: {}", client.user(), e);
                }
                self.state.invalidate_session(&session);
            }
            return;
        }

        let link = self.link.id();
        let attached: Vec<Arc<SessionProxy>> = client
            .sessions()
            .into_iter()
            .filter(|s| s.clients().iter().any(|(_, r)| r.link().id() == link))
            .collect();
        client.release_link(link);
        debug!("{}: client id {} released", client.user(), self.cid);

        match self.role {
            Some(Role::TopMaster) if client.top_links() == 0 => {
                let policy = self.state.config().shutdown;
                for session in client.sessions().into_iter().filter(|s| s.role() == Role::TopMaster) {
                    if shutdown_applies(policy.opt, session.status()) {
                        schedule_shutdown(Arc::clone(&self.state), Arc::clone(&client), session, policy.delay);
                    }
                }
            }
            Some(Role::TopMaster) | Some(Role::Admin) | None => {}
            Some(_) => {
                for session in attached.iter().filter(|s| s.role() != Role::TopMaster) {
                    info!("{}: session {} lost its master, terminating", client.user(), session.id());
                    terminate_session(&self.state, &client, session);
                }
            }
        }
    }
}

/// Terminate `session` after `delay` unless a client attaches first
fn schedule_shutdown(
    state: Arc<DaemonState>,
    client: Arc<ClientSession>,
    session: Arc<SessionProxy>,
    delay: std::time::Duration,
) {
    let token = tokio_util::sync::CancellationToken::new();
    session.schedule_shutdown(token.clone());
    debug!("session {} shutdown in {:?}", session.id(), delay);
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("session {}: scheduled shutdown cancelled", session.id());
            }
            _ = tokio::time::sleep(delay) => {
                if session.status() == SessionStatus::ShutdownScheduled {
                    info!("session {} of {} shut down: no client left", session.id(), client.user());
                    terminate_session(&state, &client, &session);
                }
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handlers::tests::{expect_error, expect_response, logged_in, proof_request, shared};
    use crate::handlers::LoginStatus;
    use crate::state::SharedState;
    use std::path::PathBuf;
    use std::time::Duration;
    use xpd_client::{Connection, LoginParams};
    use xpd_protocol::{ProofBody, RequestId};

    /// Play the session process: call back on `sock` and log in for `psid`
    pub(crate) async fn fake_proofserv(sock: PathBuf, user: String, psid: i16) -> Connection {
        let stream = loop {
            match tokio::net::UnixStream::connect(&sock).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        let mut conn = Connection::new(sock.display().to_string()).with_timeout(Duration::from_secs(5));
        conn.attach_stream(Box::new(stream)).await.unwrap();
        conn.login(&LoginParams::new(user, Role::Internal).with_reserved(psid).with_capver(16))
            .await
            .unwrap();
        conn
    }

    /// Create session `psid` for the logged-in `ctx`, with a fake process
    pub(crate) async fn create_session(ctx: &mut ConnectionContext, payload: &[u8]) -> (Response, Connection) {
        let client = Arc::clone(ctx.client().unwrap());
        let psid = client.sessions().len() as i16;
        let callback = tokio::spawn(fake_proofserv(
            client.sock_path().to_path_buf(),
            client.user().to_string(),
            psid,
        ));
        let reply = ctx
            .route_request(proof_request(RequestId::Create, ProofBody { int1: 1, ..Default::default() }, payload))
            .await;
        let proofserv = callback.await.unwrap();
        (expect_response(reply), proofserv)
    }

    async fn top_master(state: &SharedState) -> ConnectionContext {
        let (ctx, _rx) = logged_in(state, "alice", Role::TopMaster).await;
        assert_eq!(ctx.status(), LoginStatus::LoggedIn);
        ctx
    }

    // ==================== Payload Tests ====================

    #[test]
    fn test_create_payload_parsing() {
        let c = CreateRequest::parse("lxb-1-2|ord:0.4|cf:/x.cf|envs:A=1,B=2", Role::Worker);
        assert_eq!(c.tag, "lxb-1-2");
        assert_eq!(c.ordinal, "0.4");
        assert_eq!(c.cfg_file.as_deref(), Some("/x.cf"));
        assert_eq!(c.user_envs, "A=1,B=2");

        let top = CreateRequest::parse("tag|ord:0.4", Role::TopMaster);
        assert_eq!(top.ordinal, "0");
        assert_eq!(top.cfg_file, None);
        assert_eq!(CreateRequest::parse("", Role::Worker).ordinal, "0");
    }

    #[test]
    fn test_shutdown_policy() {
        assert!(!shutdown_applies(0, SessionStatus::Idle));
        assert!(shutdown_applies(1, SessionStatus::Idle));
        assert!(!shutdown_applies(1, SessionStatus::Running));
        assert!(shutdown_applies(2, SessionStatus::Running));
    }

    // ==================== Create Tests ====================

    #[tokio::test]
    async fn test_create_and_destroy() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let mut ctx = top_master(&state).await;

        let (reply, _proofserv) = create_session(&mut ctx, b"").await;
        assert_eq!(reply.int_at(0), Some(0));
        assert_eq!(reply.short_at(4), Some(16));
        assert_eq!(reply.short_at(6), Some(DAEMON_VERSION as i16));
        assert!(String::from_utf8_lossy(&reply.body[8..]).contains("proofpool"));

        let client = Arc::clone(ctx.client().unwrap());
        let session = client.session(0).unwrap();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.client_count(), 1);
        let tag = session.tag();
        assert!(!tag.is_empty());
        assert_eq!(client.sandbox().sessions(), vec![tag.clone()]);

        let reply = expect_response(
            ctx.route_request(proof_request(RequestId::Destroy, ProofBody { sid: 0, ..Default::default() }, b""))
                .await,
        );
        assert!(reply.is_ok());
        assert!(client.session(0).is_none());
        assert!(client.sandbox().sessions().is_empty());
    }

    #[tokio::test]
    async fn test_create_without_callback_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut config = crate::state::tests::test_config(&root);
        config.intwait = Duration::from_millis(300);
        let state: SharedState = Arc::new(
            DaemonState::builder(config)
                .identities(Box::new(crate::identity::SingleUserResolver::current()))
                .build()
                .unwrap(),
        );
        let mut ctx = top_master(&state).await;

        let reply = ctx
            .route_request(proof_request(RequestId::Create, ProofBody::default(), b""))
            .await;
        match reply {
            Ok(Reply::Responses(replies)) => {
                assert!(replies[0].is_ok());
                assert_eq!(replies[1].action(), Some(ActionCode::ErrMsg));
                assert!(!replies[1].attn_payload().is_empty());
            }
            other => panic!("Expected session reply and errmsg, got {:?}", other),
        }
        assert!(ctx.client().unwrap().sessions().is_empty());
    }

    // ==================== Attach/Detach Tests ====================

    #[tokio::test]
    async fn test_attach_replays_saved_messages() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (first, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(first.client().unwrap());
        let session = client.allocate_session(Role::TopMaster);
        session.with(|st| {
            st.status = SessionStatus::Running;
            st.runtime_tag = "v6".into();
            st.query_num = Some(bytes::Bytes::from_static(b"qnum"));
            st.start_msg = Some(bytes::Bytes::from_static(b"start"));
        });

        let (mut second, _rx2) = logged_in(&state, "alice", Role::TopMaster).await;
        let reply = second
            .route_request(proof_request(RequestId::Attach, ProofBody { sid: session.id(), ..Default::default() }, b""))
            .await;
        match reply {
            Ok(Reply::Responses(replies)) => {
                assert_eq!(replies.len(), 3);
                assert_eq!(replies[0].int_at(0), Some(session.id()));
                assert_eq!(replies[0].short_at(4), Some(16));
                assert_eq!(&replies[1].attn_payload()[..], b"qnum");
                assert_eq!(&replies[2].attn_payload()[..], b"start");
            }
            other => panic!("Expected attach replies, got {:?}", other),
        }
        assert_eq!(session.client_count(), 1);

        let reply = expect_response(
            second
                .route_request(proof_request(RequestId::Detach, ProofBody { sid: session.id(), ..Default::default() }, b""))
                .await,
        );
        assert!(reply.is_ok());
        assert_eq!(session.client_count(), 0);

        // Detaching twice is harmless
        let reply = expect_response(
            second
                .route_request(proof_request(RequestId::Detach, ProofBody { sid: session.id(), ..Default::default() }, b""))
                .await,
        );
        assert!(reply.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_session_ids() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let mut ctx = top_master(&state).await;
        for (id, msg) in [
            (RequestId::Attach, "session ID not found"),
            (RequestId::Detach, "session ID not found"),
            (RequestId::Destroy, "reference session ID not found"),
        ] {
            let err = expect_error(
                ctx.route_request(proof_request(id, ProofBody { sid: 9, ..Default::default() }, b""))
                    .await,
            );
            assert_eq!(err.message, msg);
        }
        // Destroy-all with no session is fine
        let reply = expect_response(
            ctx.route_request(proof_request(RequestId::Destroy, ProofBody { sid: -1, ..Default::default() }, b""))
                .await,
        );
        assert!(reply.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_notifies_other_clients() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut owner, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let (other, mut other_rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(owner.client().unwrap());
        let session = client.allocate_session(Role::TopMaster);
        session.with(|st| st.tag = "lxb-1-1".into());
        session.attach(other.cid(), crate::link::Responder::new(Arc::clone(other.link()), other.stream_id()));

        expect_response(
            owner
                .route_request(proof_request(RequestId::Destroy, ProofBody { sid: session.id(), ..Default::default() }, b""))
                .await,
        );
        let note = other_rx.try_recv().unwrap();
        assert_eq!(note.action(), Some(ActionCode::SrvMsg));
        assert_eq!(
            &note.attn_payload()[..],
            b"Destroy: session: lxb-1-1 destroyed by: lxb02.example.org"
        );
        assert!(!session.is_valid());
    }

    // ==================== Recycle Tests ====================

    #[tokio::test]
    async fn test_recycle_schedules_shutdown_of_idle_sessions() {
        let root = tempfile::tempdir().unwrap();
        let mut config = crate::state::tests::test_config(&root);
        config.shutdown.opt = 1;
        config.shutdown.delay = Duration::from_millis(100);
        let state: SharedState = Arc::new(
            DaemonState::builder(config)
                .identities(Box::new(crate::identity::SingleUserResolver::current()))
                .build()
                .unwrap(),
        );
        let (mut ctx, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(ctx.client().unwrap());
        let idle = client.allocate_session(Role::TopMaster);
        idle.set_status(SessionStatus::Idle);
        let busy = client.allocate_session(Role::TopMaster);
        busy.set_status(SessionStatus::Running);

        ctx.link().close();
        ctx.recycle().await;
        assert_eq!(idle.status(), SessionStatus::ShutdownScheduled);
        assert_eq!(busy.status(), SessionStatus::Running);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!idle.is_valid());
        assert!(busy.is_valid());
    }

    #[tokio::test]
    async fn test_scheduled_shutdown_of_running_session_releases_group() {
        let root = tempfile::tempdir().unwrap();
        let mut config = crate::state::tests::test_config(&root);
        config.shutdown.opt = 2;
        config.shutdown.delay = Duration::from_millis(100);
        let state: SharedState = Arc::new(
            DaemonState::builder(config)
                .identities(Box::new(crate::identity::SingleUserResolver::current()))
                .build()
                .unwrap(),
        );
        let (mut ctx, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(ctx.client().unwrap());
        let session = client.allocate_session(Role::TopMaster);
        session.with(|st| st.group = "default".into());
        state.session_running(&session);
        assert_eq!(state.groups.get("default").unwrap().active, 1);

        ctx.link().close();
        ctx.recycle().await;
        assert_eq!(session.status(), SessionStatus::ShutdownScheduled);
        // Still busy while the shutdown is pending
        assert!(session.is_busy());
        assert_eq!(state.groups.get("default").unwrap().active, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!session.is_valid());
        assert_eq!(state.groups.get("default").unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_login_restores_running_status_after_cancel() {
        let root = tempfile::tempdir().unwrap();
        let mut config = crate::state::tests::test_config(&root);
        config.shutdown.opt = 2;
        config.shutdown.delay = Duration::from_millis(200);
        let state: SharedState = Arc::new(
            DaemonState::builder(config)
                .identities(Box::new(crate::identity::SingleUserResolver::current()))
                .build()
                .unwrap(),
        );
        let (mut ctx, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(ctx.client().unwrap());
        let session = client.allocate_session(Role::TopMaster);
        session.with(|st| st.group = "default".into());
        state.session_running(&session);

        ctx.link().close();
        ctx.recycle().await;
        let (_again, _rx2) = logged_in(&state, "alice", Role::TopMaster).await;
        assert_eq!(session.status(), SessionStatus::Running);

        state.session_idle(&session);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(state.groups.get("default").unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_login_cancels_scheduled_shutdown() {
        let root = tempfile::tempdir().unwrap();
        let mut config = crate::state::tests::test_config(&root);
        config.shutdown.delay = Duration::from_millis(200);
        let state: SharedState = Arc::new(
            DaemonState::builder(config)
                .identities(Box::new(crate::identity::SingleUserResolver::current()))
                .build()
                .unwrap(),
        );
        let (mut ctx, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(ctx.client().unwrap());
        let session = client.allocate_session(Role::TopMaster);
        session.set_status(SessionStatus::Idle);

        ctx.link().close();
        ctx.recycle().await;
        assert_eq!(session.status(), SessionStatus::ShutdownScheduled);

        let (_again, _rx2) = logged_in(&state, "alice", Role::TopMaster).await;
        assert_eq!(session.status(), SessionStatus::Idle);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(session.is_valid());
    }

    #[tokio::test]
    async fn test_recycle_of_master_link_terminates_worker_sessions() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = logged_in(&state, "alice", Role::Worker).await;
        let client = Arc::clone(ctx.client().unwrap());
        let session = client.allocate_session(Role::Worker);
        session.set_status(SessionStatus::Idle);
        session.attach(ctx.cid(), crate::link::Responder::new(Arc::clone(ctx.link()), ctx.stream_id()));

        ctx.recycle().await;
        assert!(!session.is_valid());
        assert!(ctx.client().is_none());
    }

    #[tokio::test]
    async fn test_recycle_of_internal_link_notifies_clients() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (owner, mut owner_rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(owner.client().unwrap());
        let session = client.allocate_session(Role::TopMaster);
        session.with(|st| st.tag = "lxb-9-9".into());
        session.set_status(SessionStatus::Idle);
        session.attach(owner.cid(), crate::link::Responder::new(Arc::clone(owner.link()), owner.stream_id()));

        let (link, _lrx) = crate::link::Link::channel("localhost");
        let mut internal = ConnectionContext::for_callback(Arc::clone(&state), link, Arc::clone(&client));
        expect_response(
            internal
                .route_request(crate::handlers::tests::login_request("alice", Role::Internal, session.id() as i16, 16))
                .await,
        );
        internal.recycle().await;

        let note = owner_rx.try_recv().unwrap();
        assert_eq!(note.action(), Some(ActionCode::ErrMsg));
        assert_eq!(&note.attn_payload()[..], b"Recycle: session: lxb-9-9 terminated by peer");
        assert!(!session.is_valid());
    }
}
