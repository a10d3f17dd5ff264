//! Login-related message handlers
//!
//! Handles: Login, Auth
//!
//! A login validates the user, asserts the sandbox and then either asks
//! for credentials or maps the connection at once. Mapping binds an
//! external connection to its [`ClientSession`] and a client id, or an
//! internal one to the back-channel of the session it was spawned for.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use xpd_protocol::{ErrorCode, Request, Response, Role, DAEMON_VERSION, USER_IN_PAYLOAD};

use crate::auth::AuthOutcome;
use crate::client::{ClientSession, Sandbox};
use crate::config::{NodeRole, XpdConfig};
use crate::identity::UserIdentity;
use crate::launcher::process;
use crate::link::Responder;

use super::{ConnectionContext, HandlerResult, LoginStatus, PendingLogin, RequestError};

/// `user[:group]` from the login body, or from `|usr:` in the payload
fn parse_login_user(field: &str, payload: &str) -> Result<(String, Option<String>), RequestError> {
    let field = field.split(' ').next().unwrap_or("");
    let raw = if field == USER_IN_PAYLOAD {
        let Some(start) = payload.find("|usr:") else {
            return Err(RequestError::invalid("Login: long user name not found"));
        };
        payload[start + 5..].split('|').next().unwrap_or("").to_string()
    } else {
        field.to_string()
    };
    Ok(match raw.split_once(':') {
        Some((user, group)) => (
            user.to_string(),
            Some(group.to_string()).filter(|g| !g.is_empty()),
        ),
        None => (raw, None),
    })
}

/// Client record of `identity`: sandbox plus callback socket path
pub(super) fn new_client_record(
    cfg: &XpdConfig,
    identity: &UserIdentity,
    group: &str,
    change_owner: bool,
) -> xpd_utils::Result<ClientSession> {
    let sandbox = Sandbox::assert(&cfg.sandbox_root(&identity.home), identity, change_owner)?;
    let sock_path = cfg.admin_dir().join(format!("{}.sock", identity.user));
    Ok(ClientSession::new(identity.clone(), group, sandbox, sock_path))
}

impl ConnectionContext {
    pub(super) async fn handle_login(&mut self, req: &Request) -> HandlerResult {
        self.state.reconfigure();
        let cfg = self.state.config();
        let body = req.login();
        let role = body.role();

        if role != Some(Role::Internal) && cfg.role.checks_master() && !cfg.is_allowed_master(&self.peer_host) {
            warn!("master {} not allowed to connect", self.peer_host);
            return Err(RequestError::invalid(
                "Login: master not allowed to connect - request ignored",
            ));
        }

        match self.status {
            LoginStatus::Authenticated => {
                self.map_client().await?;
                self.status = LoginStatus::LoggedIn;
                return Ok(Response::ok().into());
            }
            LoginStatus::LoggedIn => {
                return Err(RequestError::invalid("duplicate login; already logged in"));
            }
            _ => {}
        }

        let (user, group) = parse_login_user(&body.username_str(), &req.payload_str())?;
        let identity = self
            .check_user(&user, &cfg)
            .map_err(|e| RequestError::invalid(format!("Login: ClientID not allowed: {}: {}", user, e)))?;

        if let Some(g) = group.as_deref() {
            if self.state.groups.get(g).is_none() {
                return Err(RequestError::invalid(format!("Login: group unknown: {}", g)));
            }
        }
        let group = self
            .state
            .groups
            .resolve(&user, group.as_deref())
            .map_err(|_| {
                RequestError::invalid(format!(
                    "Login: user {} is not member of group {}",
                    user,
                    group.as_deref().unwrap_or("")
                ))
            })?;

        self.assert_dirs(&cfg, &identity, &group)?;

        let role = match role {
            Some(role) => role,
            None => return Err(RequestError::invalid("Server type: invalide mode")),
        };
        if !cfg.role.admits(role) {
            let what = match role {
                Role::TopMaster => "top master",
                Role::SubMaster => "submaster",
                _ => "worker",
            };
            return Err(RequestError::invalid(format!(
                "Server not allowed to be {} - ignoring request",
                what
            )));
        }

        info!(
            "login: {} ({}) from {} as {}, pid {}",
            user, group, self.peer_host, role, body.pid
        );
        self.role = Some(role);
        self.pending = Some(PendingLogin {
            identity,
            group,
            reserved: body.reserved_i16(),
            capver: body.capver,
        });

        if !matches!(role, Role::Admin | Role::Internal) {
            if let Some(params) = self.state.authenticator.parameters() {
                self.status = LoginStatus::Authenticating;
                return Ok(Response::ok_int_data(DAEMON_VERSION, &params).into());
            }
        }

        self.map_client().await?;
        self.status = LoginStatus::LoggedIn;
        Ok(Response::ok_int(DAEMON_VERSION).into())
    }

    pub(super) async fn handle_auth(&mut self, req: &Request) -> HandlerResult {
        if self.state.authenticator.parameters().is_none() {
            return Ok(Response::ok().into());
        }
        if self.status != LoginStatus::Authenticating {
            return Err(RequestError::invalid("Auth: login sequence not started"));
        }
        let cred_type = req.auth().cred_type_str();
        match self
            .state
            .authenticator
            .authenticate(&cred_type, &req.payload, &self.peer_host)
        {
            AuthOutcome::Authenticated { name, credentials } => {
                debug!("{} authenticated with {} credentials", name, cred_type);
                self.credentials = credentials;
                self.status = LoginStatus::Authenticated;
                Ok(Response::ok().into())
            }
            AuthOutcome::Continue(challenge) if !challenge.is_empty() => {
                Ok(Response::auth_more(challenge).into())
            }
            AuthOutcome::Continue(_) => {
                Err(RequestError::server("invalid authentication exchange").closing())
            }
            AuthOutcome::Failed(reason) => {
                warn!("authentication failure for {}: {}", self.peer_host, reason);
                Err(RequestError::new(ErrorCode::NotAuthorized, reason).closing())
            }
        }
    }

    // ==================== Checks ====================

    fn check_user(&self, user: &str, cfg: &XpdConfig) -> Result<UserIdentity, String> {
        if user.is_empty() {
            return Err("Login: 'usr' string is undefined ".into());
        }
        if user == "root" {
            return Err("Login: 'root' logins not accepted ".into());
        }
        let identity = self
            .state
            .identities
            .resolve(user)
            .map_err(|_| format!("Login: unknown ClientID: {}", user))?;
        if !cfg.allowed_users.is_empty() && !cfg.allowed_users.iter().any(|u| u == user) && !cfg.is_superuser(user) {
            return Err(format!(
                "Login: controlled operations: user not currently authorized to log in: {}",
                user
            ));
        }
        Ok(identity)
    }

    /// Sandbox, dataset area and credential directory of the user
    fn assert_dirs(&self, cfg: &XpdConfig, identity: &UserIdentity, group: &str) -> Result<(), RequestError> {
        let change_owner = self.state.identities.can_change_owner();
        let root = cfg.sandbox_root(&identity.home);
        let sandbox = Sandbox::assert(&root, identity, change_owner).map_err(|e| {
            debug!("sandbox: {}", e);
            RequestError::server(format!(
                "Login: unable to create work dir: {}",
                root.join(&identity.user).display()
            ))
        })?;

        if let Some(dataset_dir) = &cfg.dataset_dir {
            if matches!(cfg.role, NodeRole::Any | NodeRole::TopMaster) {
                let dir = PathBuf::from(dataset_dir).join(group).join(&identity.user);
                sandbox.assert_dir(&dir).map_err(|_| {
                    RequestError::server(format!("Login: unable to assert dataset dir: {}", dir.display()))
                })?;
            }
        }

        if self.state.authenticator.parameters().is_some() {
            let creds = sandbox.dir().join(".creds");
            sandbox.assert_dir(&creds).map_err(|_| {
                RequestError::server(format!(
                    "Login: unable to create credential dir: {}",
                    creds.display()
                ))
            })?;
        }
        Ok(())
    }

    // ==================== Mapping ====================

    async fn map_client(&mut self) -> Result<(), RequestError> {
        let Some(pending) = self.pending.clone() else {
            return Err(RequestError::server("MapClient: no login in progress").closing());
        };
        let cfg = self.state.config();
        self.superuser = cfg.is_superuser(&pending.identity.user);

        if self.role == Some(Role::Internal) {
            return self.map_internal(&pending);
        }

        let user = pending.identity.user.clone();
        let state = Arc::clone(&self.state);
        let change_owner = state.identities.can_change_owner();
        let client = self
            .state
            .clients
            .get_or_create(&user, || {
                for pid in process::find_session_processes(pending.identity.uid, std::process::id()) {
                    info!("{}: killing leftover session process {}", user, pid);
                    if let Err(e) = state.supervisor.kill(pid, true) {
                        debug!("kill {}: {}", pid, e);
                    }
                }
                let client = new_client_record(&cfg, &pending.identity, &pending.group, change_owner)?;
                if let Err(e) = client.sandbox().retire_sessions(cfg.max_old_logs) {
                    warn!("{}: cannot retire old sessions: {}", user, e);
                }
                Ok(client)
            })
            .map_err(|e| RequestError::server(format!("MapClient: cannot create client record: {}", e)).closing())?;

        client.set_version(pending.reserved);
        client.set_group(pending.group.clone());
        let role = self.role.unwrap_or(Role::TopMaster);
        self.cid = client.assign_link(Arc::clone(&self.link), role);
        if role == Role::TopMaster {
            for session in client.sessions().iter().filter(|s| s.role() == Role::TopMaster) {
                if session.cancel_shutdown() {
                    debug!("{}: shutdown of session {} cancelled", user, session.id());
                }
            }
        }
        debug!("{} mapped with client id {}", user, self.cid);
        self.client = Some(client);
        Ok(())
    }

    /// Bind a session process connection to its session
    fn map_internal(&mut self, pending: &PendingLogin) -> Result<(), RequestError> {
        let psid = i32::from(pending.reserved);
        if psid < 0 {
            return Err(RequestError::invalid(
                "MapClient: proofsrv callback: sent invalid session id",
            ));
        }
        let client = self
            .callback_owner
            .clone()
            .or_else(|| self.state.clients.find(&pending.identity.user, Some(pending.group.as_str())))
            .ok_or_else(|| {
                RequestError::invalid("MapClient: proofsrv callback: client not found").closing()
            })?;
        let session = client.session(psid).ok_or_else(|| {
            RequestError::new(
                ErrorCode::NoSession,
                "MapClient: proofsrv callback: wrong target session: protocol error",
            )
            .closing()
        })?;
        session.bind_back_channel(
            Responder::new(Arc::clone(&self.link), self.stream_id),
            i32::from(pending.capver),
        );
        debug!("session {} of {} bound to link {}", psid, client.user(), self.link.id());
        self.internal = Some(session);
        self.client = Some(client);
        Ok(())
    }

    /// Whether the logged-in user is a superuser
    pub(super) fn is_superuser(&self) -> bool {
        self.superuser
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthOutcome, Authenticator};
    use crate::handlers::tests::{create_test_context, expect_error, expect_response, login_request, logged_in, shared};
    use crate::identity::SingleUserResolver;
    use crate::state::tests::test_config;
    use crate::state::{DaemonState, SharedState};
    use xpd_protocol::{AuthBody, RequestId, StreamId};

    struct PasswordAuth;

    impl Authenticator for PasswordAuth {
        fn parameters(&self) -> Option<Vec<u8>> {
            Some(b"pwd:".to_vec())
        }

        fn authenticate(&self, _cred_type: &str, credentials: &[u8], _host: &str) -> AuthOutcome {
            match credentials {
                b"secret" => AuthOutcome::Authenticated {
                    name: "alice".into(),
                    credentials: Some(b"token".to_vec()),
                },
                b"more" => AuthOutcome::Continue(b"again".to_vec()),
                b"empty" => AuthOutcome::Continue(Vec::new()),
                _ => AuthOutcome::Failed("bad password".into()),
            }
        }
    }

    fn state_with(root: &tempfile::TempDir, edit: impl FnOnce(&mut XpdConfig)) -> SharedState {
        let mut config = test_config(root);
        edit(&mut config);
        Arc::new(
            DaemonState::builder(config)
                .identities(Box::new(SingleUserResolver::current()))
                .build()
                .unwrap(),
        )
    }

    fn auth_state(root: &tempfile::TempDir) -> SharedState {
        Arc::new(
            DaemonState::builder(test_config(root))
                .identities(Box::new(SingleUserResolver::current()))
                .authenticator(Box::new(PasswordAuth))
                .build()
                .unwrap(),
        )
    }

    fn auth_request(creds: &[u8]) -> Request {
        let body = AuthBody { cred_type: *b"pwd\0" };
        Request::new(StreamId::from_u16(1), RequestId::Auth, body.encode(), creds.to_vec())
    }

    // ==================== User Parsing Tests ====================

    #[test]
    fn test_parse_login_user() {
        assert_eq!(parse_login_user("alice", "").unwrap(), ("alice".into(), None));
        assert_eq!(
            parse_login_user("al:dev", "").unwrap(),
            ("al".into(), Some("dev".into()))
        );
        assert_eq!(
            parse_login_user("?>buf", "x|usr:averylongname:phys|tag").unwrap(),
            ("averylongname".into(), Some("phys".into()))
        );
        let err = parse_login_user("?>buf", "nothing here").unwrap_err();
        assert_eq!(err.message, "Login: long user name not found");
    }

    // ==================== Login Tests ====================

    #[tokio::test]
    async fn test_login_replies_daemon_version() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = create_test_context(&state);
        let resp = expect_response(ctx.route_request(login_request("alice", Role::TopMaster, 33, 16)).await);
        assert_eq!(resp.int_at(0), Some(DAEMON_VERSION));
        assert_eq!(ctx.status(), LoginStatus::LoggedIn);
        assert_eq!(ctx.cid(), 0);

        let client = state.clients.find("alice", None).unwrap();
        assert_eq!(client.version(), 33);
        assert_eq!(client.group(), "default");
        assert!(root.path().join("pool").join("alice").is_dir());
    }

    #[tokio::test]
    async fn test_second_connection_gets_next_client_id() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (first, _rx1) = logged_in(&state, "alice", Role::TopMaster).await;
        let (second, _rx2) = logged_in(&state, "alice", Role::TopMaster).await;
        assert_eq!(first.cid(), 0);
        assert_eq!(second.cid(), 1);
        assert!(Arc::ptr_eq(first.client().unwrap(), second.client().unwrap()));
        assert_eq!(state.clients.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_login_rejected() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let err = expect_error(ctx.route_request(login_request("alice", Role::TopMaster, 16, 16)).await);
        assert_eq!(err.message, "duplicate login; already logged in");
    }

    #[tokio::test]
    async fn test_root_and_empty_users_rejected() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = create_test_context(&state);
        let err = expect_error(ctx.route_request(login_request("root", Role::TopMaster, 16, 16)).await);
        assert_eq!(
            err.message,
            "Login: ClientID not allowed: root: Login: 'root' logins not accepted "
        );
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let err = expect_error(ctx.route_request(login_request("", Role::TopMaster, 16, 16)).await);
        assert!(err.message.contains("'usr' string is undefined"));
        assert_eq!(ctx.status(), LoginStatus::Anonymous);
    }

    #[tokio::test]
    async fn test_controlled_mode() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(&root, |c| c.allowed_users = vec!["bob".into()]);
        let (mut ctx, _rx) = create_test_context(&state);
        let err = expect_error(ctx.route_request(login_request("alice", Role::TopMaster, 16, 16)).await);
        assert!(err
            .message
            .ends_with("controlled operations: user not currently authorized to log in: alice"));

        let (mut ctx, _rx) = create_test_context(&state);
        assert!(expect_response(ctx.route_request(login_request("bob", Role::TopMaster, 16, 16)).await).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = create_test_context(&state);
        let err = expect_error(ctx.route_request(login_request("al:nogrp", Role::TopMaster, 16, 16)).await);
        assert_eq!(err.message, "Login: group unknown: nogrp");
    }

    #[tokio::test]
    async fn test_worker_node_refuses_top_master() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(&root, |c| {
            c.role = NodeRole::Worker;
            c.allow = vec!["lxb02.example.org".into()];
        });
        let (mut ctx, _rx) = create_test_context(&state);
        let err = expect_error(ctx.route_request(login_request("alice", Role::TopMaster, 16, 16)).await);
        assert_eq!(err.message, "Server not allowed to be top master - ignoring request");

        let (mut ctx, _rx) = create_test_context(&state);
        assert!(expect_response(ctx.route_request(login_request("alice", Role::Worker, 16, 16)).await).is_ok());
    }

    #[tokio::test]
    async fn test_worker_node_checks_master_host() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(&root, |c| {
            c.role = NodeRole::Worker;
            c.allow = vec!["master.example.org".into()];
        });
        let (mut ctx, _rx) = create_test_context(&state);
        let err = expect_error(ctx.route_request(login_request("alice", Role::Worker, 16, 16)).await);
        assert_eq!(err.message, "Login: master not allowed to connect - request ignored");
    }

    #[tokio::test]
    async fn test_invalid_role_byte() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (mut ctx, _rx) = create_test_context(&state);
        let mut req = login_request("alice", Role::TopMaster, 16, 16);
        req.body[15] = b'z';
        let err = expect_error(ctx.route_request(req).await);
        assert_eq!(err.message, "Server type: invalide mode");
    }

    #[tokio::test]
    async fn test_superuser_flag() {
        let root = tempfile::tempdir().unwrap();
        let state = state_with(&root, |c| c.superusers = vec!["alice".into()]);
        let (ctx, _rx) = logged_in(&state, "alice", Role::Admin).await;
        assert!(ctx.is_superuser());
        let (ctx, _rx) = logged_in(&state, "bob", Role::Admin).await;
        assert!(!ctx.is_superuser());
    }

    // ==================== Internal Mapping Tests ====================

    #[tokio::test]
    async fn test_internal_login_binds_back_channel() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (owner, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(owner.client().unwrap());
        let session = client.allocate_session(Role::TopMaster);

        let (link, _lrx) = crate::link::Link::channel("localhost");
        let mut ctx = ConnectionContext::for_callback(Arc::clone(&state), link, Arc::clone(&client));
        let resp = expect_response(
            ctx.route_request(login_request("alice", Role::Internal, session.id() as i16, 16))
                .await,
        );
        assert!(resp.is_ok());
        assert!(session.back_channel().is_some());
        assert_eq!(session.with(|st| st.srv_proto), 16);
    }

    #[tokio::test]
    async fn test_internal_login_wrong_session() {
        let root = tempfile::tempdir().unwrap();
        let state = shared(&root);
        let (owner, _rx) = logged_in(&state, "alice", Role::TopMaster).await;
        let client = Arc::clone(owner.client().unwrap());

        let (link, _lrx) = crate::link::Link::channel("localhost");
        let mut ctx = ConnectionContext::for_callback(Arc::clone(&state), Arc::clone(&link), Arc::clone(&client));
        let err = expect_error(ctx.route_request(login_request("alice", Role::Internal, 7, 16)).await);
        assert_eq!(err.code, ErrorCode::NoSession);
        assert!(err.close);

        let (link, _lrx) = crate::link::Link::channel("localhost");
        let mut ctx = ConnectionContext::for_callback(Arc::clone(&state), link, client);
        let err = expect_error(ctx.route_request(login_request("alice", Role::Internal, -1, 16)).await);
        assert_eq!(err.message, "MapClient: proofsrv callback: sent invalid session id");
    }

    // ==================== Auth Tests ====================

    #[tokio::test]
    async fn test_auth_sequence() {
        let root = tempfile::tempdir().unwrap();
        let state = auth_state(&root);
        let (mut ctx, _rx) = create_test_context(&state);

        let resp = expect_response(ctx.route_request(login_request("alice", Role::TopMaster, 16, 16)).await);
        assert_eq!(resp.int_at(0), Some(DAEMON_VERSION));
        assert_eq!(&resp.body[4..], b"pwd:");
        assert_eq!(ctx.status(), LoginStatus::Authenticating);
        assert!(root.path().join("pool").join("alice").join(".creds").is_dir());

        let resp = expect_response(ctx.route_request(auth_request(b"more")).await);
        assert_eq!(resp.status, xpd_protocol::ResponseStatus::AuthMore);

        assert!(expect_response(ctx.route_request(auth_request(b"secret")).await).is_ok());
        assert_eq!(ctx.status(), LoginStatus::Authenticated);

        assert!(expect_response(ctx.route_request(login_request("alice", Role::TopMaster, 16, 16)).await).is_ok());
        assert_eq!(ctx.status(), LoginStatus::LoggedIn);
        assert!(ctx.client().is_some());
    }

    #[tokio::test]
    async fn test_auth_failure_closes() {
        let root = tempfile::tempdir().unwrap();
        let state = auth_state(&root);
        let (mut ctx, _rx) = create_test_context(&state);
        expect_response(ctx.route_request(login_request("alice", Role::TopMaster, 16, 16)).await);

        let err = expect_error(ctx.route_request(auth_request(b"wrong")).await);
        assert_eq!(err.code, ErrorCode::NotAuthorized);
        assert!(err.close);

        let (mut ctx, _rx) = create_test_context(&state);
        expect_response(ctx.route_request(login_request("alice", Role::TopMaster, 16, 16)).await);
        let err = expect_error(ctx.route_request(auth_request(b"empty")).await);
        assert_eq!(err.message, "invalid authentication exchange");
        assert!(err.close);
    }

    #[tokio::test]
    async fn test_admin_skips_auth() {
        let root = tempfile::tempdir().unwrap();
        let state = auth_state(&root);
        let (mut ctx, _rx) = create_test_context(&state);
        let resp = expect_response(ctx.route_request(login_request("alice", Role::Admin, 16, 16)).await);
        assert_eq!(resp.body.len(), 4);
        assert_eq!(ctx.status(), LoginStatus::LoggedIn);
    }
}
