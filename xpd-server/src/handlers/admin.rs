//! Administrative request handlers
//!
//! Handles: Admin, sub-typed by `int1` of the proof body.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, info, warn};

use xpd_protocol::{ActionCode, AdminType, Request, Response, Role, ServerType, MAX_ALIAS_LEN, MAX_TAG_LEN};

use crate::client::ClientSession;
use crate::config::{NodeRole, SchedMode};
use crate::launcher::process;
use crate::selector::SelectionContext;
use crate::topology::BroadcastReport;

use super::login::new_client_record;
use super::{terminate_session, ConnectionContext, HandlerResult, RequestError};

/// Text replies carry a trailing NUL
fn text_reply(text: String) -> Response {
    let mut data = text.into_bytes();
    data.push(0);
    Response::ok_data(data)
}

/// Payload up to `max - 1` bytes, lossily decoded
fn truncated(payload: &Bytes, max: usize) -> String {
    let len = payload.len().min(max.saturating_sub(1));
    String::from_utf8_lossy(&payload[..len]).into_owned()
}

/// `<url> <status> <ord> <path>` line of a session's `.workers` file
fn parse_workers_line(line: &str) -> Option<(&str, &str, &str)> {
    let (url, rest) = line.split_once(' ')?;
    let (_status, rest) = rest.split_once(' ')?;
    let (ord, path) = rest.split_once(' ')?;
    Some((url, ord, path))
}

/// Target and tag of a ChangeDefaultVersion payload `[u:user[:group] ]tag`
fn parse_version_change(payload: &str) -> (Option<(String, Option<String>)>, String) {
    let payload = payload.trim_end_matches('\0').trim();
    let Some(rest) = payload.strip_prefix("u:") else {
        return (None, payload.to_string());
    };
    match rest.split_once(' ') {
        Some((who, tag)) => {
            let target = match who.split_once(':') {
                Some((user, group)) => (user.to_string(), Some(group.to_string())),
                None => (who.to_string(), None),
            };
            (Some(target), tag.trim().to_string())
        }
        None => (None, rest.to_string()),
    }
}

fn log_broadcast(what: &str, outcome: Result<BroadcastReport, String>) {
    match outcome {
        Ok(report) if report.is_complete() => debug!("{} broadcast reached {} nodes", what, report.sent),
        Ok(report) => info!(
            "{} broadcast reached {} nodes; failures:\n{}",
            what,
            report.sent,
            report.message().unwrap_or_default()
        ),
        Err(e) => warn!("{} broadcast: {}", what, e),
    }
}

impl ConnectionContext {
    pub(super) async fn handle_admin(&mut self, req: &Request) -> HandlerResult {
        let body = req.proof();
        debug!("admin: type {}, psid {}", body.int1, body.sid);
        let Some(kind) = AdminType::from_i32(body.int1) else {
            return Err(RequestError::invalid("Admin: unknown request type"));
        };
        match kind {
            AdminType::QuerySessions => self.query_sessions(),
            AdminType::QueryLogPaths => self.query_log_paths(req),
            AdminType::CleanupSessions => self.cleanup_sessions(req).await,
            AdminType::SessionTag | AdminType::SessionAlias => self.name_session(kind, req),
            AdminType::GroupProperties => self.group_properties(req),
            AdminType::GetWorkers => self.get_workers(req),
            AdminType::QueryWorkers => {
                let info = self
                    .state
                    .selector
                    .export_info(&self.state.topology.workers(), &self.state.config().resource);
                Ok(text_reply(info).into())
            }
            AdminType::QueryVersions => {
                let client = self.bound_client()?;
                let listing = self.state.versions.export(client.runtime_tag().as_deref());
                Ok(text_reply(listing).into())
            }
            AdminType::ChangeDefaultVersion => self.change_default_version(req).await,
            AdminType::ReadBuffer => Err(RequestError::invalid("Admin: unknown request type")),
        }
    }

    // ==================== Queries ====================

    fn query_sessions(&self) -> HandlerResult {
        let client = self.bound_client()?;
        let top: Vec<_> = client
            .sessions()
            .into_iter()
            .filter(|s| s.role() == Role::TopMaster)
            .collect();
        let mut out = top.len().to_string();
        for session in &top {
            out.push_str(" | ");
            out.push_str(&session.export());
        }
        debug!("admin: sending: {}", out);
        Ok(text_reply(out).into())
    }

    fn query_log_paths(&self, req: &Request) -> HandlerResult {
        let client = self.bound_client()?;
        let ridx = req.proof().int2;
        let wanted = req.payload_str();
        let wanted = wanted.trim_end_matches('\0');

        let tag = if !wanted.is_empty() && !wanted.starts_with('*') {
            wanted.to_string()
        } else {
            client
                .sandbox()
                .guess_tag("last", ridx)
                .ok_or_else(|| RequestError::invalid("Admin: query log: session tag not found"))?
        };

        let cfg = self.state.config();
        let pool_url = cfg.pool_url.clone().unwrap_or_else(|| format!("root://{}", cfg.host));
        let mut out = format!("{}|{}|", tag, pool_url);

        let sdir = client.sandbox().session_dir(&tag);
        let entries = std::fs::read_dir(&sdir).map_err(|e| {
            RequestError::invalid(format!(
                "Admin: cannot open dir {} (errno: {})",
                sdir.display(),
                e.raw_os_error().unwrap_or(0)
            ))
        })?;
        let master_log = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .find(|name| name.starts_with("master-") && name.contains(".log"));
        if let Some(name) = master_log {
            out.push_str(&format!("|0 proof://{}:{}/{}/{}", cfg.host, cfg.port, sdir.display(), name));
        }

        if let Ok(content) = std::fs::read_to_string(sdir.join(".workers")) {
            for (url, ord, path) in content.lines().filter_map(parse_workers_line) {
                out.push_str(&format!("|{} {}/{}", ord, url, path));
            }
        }
        Ok(text_reply(out).into())
    }

    fn get_workers(&self, req: &Request) -> HandlerResult {
        let session = self.session_or(req.proof().sid, "session ID not found")?;
        let cfg = self.state.config();
        let nodes = self.state.topology.workers();

        let priority_of = |group: &str| self.state.groups.get(group).map_or(1.0, |g| g.priority);
        let mut ctx = SelectionContext {
            group_priority: priority_of(&session.group()),
            ..SelectionContext::default()
        };
        for client in self.state.clients.all() {
            for s in client.sessions() {
                if s.is_busy() {
                    ctx.running_sessions += 1;
                    ctx.summed_priority += priority_of(&s.group());
                }
            }
        }

        let picked = self
            .state
            .selector
            .select(&nodes, &cfg.resource, &ctx)
            .map_err(|e| {
                warn!("{}: worker selection failed: {}", self.state.selector.name(), e);
                RequestError::invalid("Admin: GetWorkers failed")
            })?;

        let mut out = String::new();
        let mut keys = Vec::with_capacity(picked.len());
        for idx in picked {
            let Some(node) = nodes.get(idx) else { continue };
            out.push_str(&node.export());
            out.push('&');
            keys.push(node.key());
        }
        self.state.topology.assign(&keys);
        session.with(|st| st.assigned.extend(keys));
        debug!("admin: GetWorkers: sending: {}", out);
        Ok(text_reply(out).into())
    }

    // ==================== Session Settings ====================

    fn name_session(&self, kind: AdminType, req: &Request) -> HandlerResult {
        let session = self.session_or(req.proof().sid, "Admin: session ID not found")?;
        if req.payload.is_empty() {
            return Ok(Response::ok().into());
        }
        if kind == AdminType::SessionTag {
            let tag = truncated(&req.payload, MAX_TAG_LEN);
            debug!("admin: session tag set to: {}", tag);
            session.with(|st| st.tag = tag);
        } else {
            let alias = truncated(&req.payload, MAX_ALIAS_LEN);
            debug!("admin: session alias set to: {}", alias);
            session.with(|st| st.alias = alias);
        }
        Ok(Response::ok().into())
    }

    fn group_properties(&self, req: &Request) -> HandlerResult {
        let body = req.proof();
        let session = self.session_or(body.sid, "Admin: session ID not found")?;
        let group = req.payload_str();
        let group = group.trim_end_matches('\0');
        if session.group() != group {
            return Err(RequestError::invalid(
                "Admin: received group does not match the user's one",
            ));
        }
        if !self.state.groups.set_priority(group, body.int2 as f32) {
            return Err(RequestError::invalid(format!("Admin: group '{}' undefined", group)));
        }
        // Scheduling must be on for the new priority to matter
        self.state.config.rcu(|cfg| {
            let mut cfg = (**cfg).clone();
            cfg.sched.enabled = true;
            cfg.sched.mode = SchedMode::Priority;
            cfg.sched.overall = 1.05;
            cfg
        });
        self.state.scheduler.recompute(&self.state.clients);
        info!("priority for group '{}' set to {}", group, body.int2);
        Ok(Response::ok().into())
    }

    // ==================== Cleanup ====================

    async fn cleanup_sessions(&self, req: &Request) -> HandlerResult {
        let own = self.bound_client()?;
        let srvtype = req.proof().int2;
        let all = self.is_superuser() && srvtype == ServerType::All.as_i32();

        let (targets, user): (Vec<Arc<ClientSession>>, String) = if all {
            debug!("admin: CleanupSessions: superuser, all sessions cleaned");
            (self.state.clients.all(), String::new())
        } else if self.is_superuser() && !req.payload.is_empty() {
            let wanted = req.payload_str();
            let wanted = wanted.trim_end_matches('\0');
            let (user, group) = match wanted.split_once(':') {
                Some((u, g)) => (u, Some(g)),
                None => (wanted, None),
            };
            debug!("admin: CleanupSessions: superuser, cleaning user: {}", user);
            let found = self.state.clients.find(user, group);
            if found.is_none() {
                debug!("admin: CleanupSessions: {} has no sessions", user);
            }
            (found.into_iter().collect(), user.to_string())
        } else {
            (vec![Arc::clone(&own)], own.user().to_string())
        };

        let notice = format!(
            "Admin: CleanupSessions: cleaning up client: requested by: {}",
            self.link.peer()
        );
        let mut signalled = Vec::new();
        for client in &targets {
            for link in client.top_master_links() {
                if link.id() == self.link.id() {
                    continue;
                }
                link.send(Response::attn_text(ActionCode::SrvMsg, &notice)).await;
                link.close();
            }
            for session in client.sessions() {
                let matching = all || ServerType::of_role(session.role()).map(|t| t.as_i32()) == Some(srvtype);
                if !matching {
                    continue;
                }
                if let Some(pid) = session.pid() {
                    signalled.push(pid);
                }
                terminate_session(&self.state, client, &session);
            }
        }

        let supervisor = &self.state.supervisor;
        join_all(signalled.iter().map(|pid| supervisor.poll_then_kill(*pid))).await;

        // Stragglers not tracked as sessions
        for client in &targets {
            for pid in process::find_session_processes(client.identity().uid, std::process::id()) {
                if let Err(e) = supervisor.kill(pid, true) {
                    debug!("kill {}: {}", pid, e);
                }
            }
        }

        let notify = self.responder();
        let outcome = self
            .state
            .broadcaster
            .broadcast(AdminType::CleanupSessions, &user, Some(&notify))
            .await;
        log_broadcast("cleanup", outcome);
        Ok(Response::ok().into())
    }

    // ==================== Versions ====================

    async fn change_default_version(&self, req: &Request) -> HandlerResult {
        let own = self.bound_client()?;
        let (target, tag) = parse_version_change(&req.payload_str());
        debug!("admin: version tag: {}", tag);

        let client = match target {
            Some((user, group)) if user != own.user() => {
                if !self.is_superuser() {
                    return Err(RequestError::invalid(format!(
                        "Admin: not allowed to change settings for usr '{}'",
                        user
                    )));
                }
                let group = match group {
                    Some(g) => g,
                    None => self.state.groups.resolve(&user, None).unwrap_or_else(|_| "default".into()),
                };
                self.client_record(&user, &group)?
            }
            _ => own,
        };

        let version = self.state.versions.get(&tag);
        if let Some(v) = &version {
            client.set_runtime_tag(Some(v.tag.clone()));
            info!("default version of {} changed to {}", client.user(), v.tag);
        }

        if self.state.config().role != NodeRole::Worker {
            let msg = format!("u:{} {}", client.user(), tag);
            let notify = self.responder();
            let outcome = self
                .state
                .broadcaster
                .broadcast(AdminType::ChangeDefaultVersion, &msg, Some(&notify))
                .await;
            log_broadcast("version", outcome);
        }

        match version {
            Some(_) => Ok(Response::ok().into()),
            None => Err(RequestError::invalid(format!(
                "Admin: tag '{}' not found in the list of available ROOT versions",
                tag
            ))),
        }
    }

    /// Record of `user`, created (unmapped) if the user never logged in
    fn client_record(&self, user: &str, group: &str) -> Result<Arc<ClientSession>, RequestError> {
        if let Some(client) = self.state.clients.find(user, Some(group)) {
            return Ok(client);
        }
        let identity = self
            .state
            .identities
            .resolve(user)
            .map_err(|e| RequestError::invalid(format!("Admin: user not found: {}: {}", user, e)))?;
        let cfg = self.state.config();
        let change_owner = self.state.identities.can_change_owner();
        self.state
            .clients
            .get_or_create(user, || new_client_record(&cfg, &identity, group, change_owner))
            .map_err(|e| RequestError::server(format!("Admin: cannot create client record: {}", e)))
    }
}
