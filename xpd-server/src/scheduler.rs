//! Fair-share inflate factors
//!
//! Running sessions are throttled toward the share of their group: the
//! session process stretches its CPU accounting by `inflate / 1000`. The
//! computation is a pure function over a snapshot of groups and running
//! sessions; [`Scheduler::recompute`] gathers the snapshot and delivers the
//! factors as `Inflate` attn messages.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use xpd_protocol::{ActionCode, Response};

use crate::client::ClientRegistry;
use crate::config::{ConfigHandle, Group, GroupRegistry, SchedMode, SchedOptions};
use crate::session::SessionProxy;

/// No throttling
pub const NEUTRAL_INFLATE: i32 = 1000;

/// Share (percent) kept for groups without a declared fraction when the
/// declared ones exceed 100%
const FRACTION_CUSHION: f32 = 0.5;

/// A running session as seen by the scheduler
#[derive(Debug, Clone)]
pub struct RunningSession<K> {
    pub key: K,
    pub group: String,
    /// Server processes of the owning client
    pub servers: usize,
}

/// Outcome of a computation
#[derive(Debug, Clone, PartialEq)]
pub enum InflatePlan<K> {
    /// Leave the current factors alone
    Unchanged,
    /// Same factor for every running session
    Uniform(i32),
    /// Factor per session
    PerSession(Vec<(K, i32)>),
}

/// Effective fraction of each active group, `None` when every active
/// group has the same priority (priority mode)
fn group_fractions(groups: &[Group], mode: SchedMode) -> Option<HashMap<String, f32>> {
    let active: Vec<&Group> = groups.iter().filter(|g| g.active > 0).collect();

    let mut prmin = f32::MAX;
    let mut prmax = f32::MIN;
    let mut totfrac = 0.0f32;
    let mut nofrac = 0usize;
    let mut eff: HashMap<String, f32> = HashMap::new();
    for g in &active {
        prmin = prmin.min(g.priority);
        prmax = prmax.max(g.priority);
        if g.fraction > 0.0 {
            eff.insert(g.name.clone(), g.fraction);
            totfrac += g.fraction;
        } else {
            nofrac += 1;
        }
    }

    match mode {
        SchedMode::Priority => {
            if active.is_empty() || prmin == prmax || prmin <= 0.0 {
                return None;
            }
            // Proportional to the priority, normalized later
            eff = active
                .iter()
                .map(|g| (g.name.clone(), g.priority / prmin))
                .collect();
        }
        SchedMode::Fraction => {
            let undeclared = active.iter().filter(|g| g.fraction <= 0.0);
            if totfrac < 100.0 && nofrac > 0 {
                let share = (100.0 - totfrac) / nofrac as f32;
                for g in undeclared {
                    eff.insert(g.name.clone(), share);
                }
            } else if totfrac > 100.0 {
                let norm = if nofrac > 0 {
                    (100.0 - FRACTION_CUSHION) / totfrac
                } else {
                    100.0 / totfrac
                };
                for v in eff.values_mut() {
                    *v *= norm;
                }
                let share = if nofrac > 0 {
                    FRACTION_CUSHION / nofrac as f32
                } else {
                    0.0
                };
                for g in undeclared {
                    eff.insert(g.name.clone(), share);
                }
            }
        }
    }
    Some(eff)
}

/// Balancing coefficients for fractions sorted by decreasing value.
///
/// The lowest share fixes the normalization; each higher share is then
/// derived from the one below it.
fn alphas(sorted: &[f32]) -> Vec<f32> {
    let n = sorted.len();
    if n == 0 {
        return Vec::new();
    }
    let total: f32 = sorted.iter().sum();
    let nn = n - 1;
    let mut aa = vec![0.0f32; n];
    let mut t = 0.0f32;
    for i in (0..n).rev() {
        let f = sorted[i] / total;
        if i == nn {
            aa[i] = (1.0 - f * (nn + 1) as f32) / f;
            t = (nn + 1) as f32 + aa[i];
        } else {
            let fr = f * t - 1.0;
            let ar: f32 = (i + 1..nn)
                .map(|j| (aa[j + 1] - aa[j]) / (j + 1) as f32)
                .sum();
            aa[i] = aa[i + 1] - (i + 1) as f32 * (fr - ar);
        }
        trace!("alpha[{}] = {} (norm frac {})", i, aa[i], f);
    }
    aa
}

/// Compute inflate factors.
///
/// Sessions whose group is unknown or inactive are skipped with a warning:
/// a reload may have removed a group that still has running members.
pub fn compute<K: Clone>(
    groups: &[Group],
    running: &[RunningSession<K>],
    opts: &SchedOptions,
    ncpu: usize,
) -> InflatePlan<K> {
    if !opts.enabled || groups.len() <= 1 {
        return InflatePlan::Unchanged;
    }
    match running.len() {
        0 => return InflatePlan::Unchanged,
        1 => return InflatePlan::Uniform(NEUTRAL_INFLATE),
        _ => {}
    }
    let overall = opts.overall.max(1.0);

    let Some(eff) = group_fractions(groups, opts.mode) else {
        // Equal priorities: only the global multiplier applies
        if overall >= 1.01 {
            return InflatePlan::Uniform((overall * 1000.0) as i32);
        }
        debug!("every active group has the same priority: no action");
        return InflatePlan::Unchanged;
    };

    let mut weighted: Vec<(K, f32)> = Vec::with_capacity(running.len());
    for s in running {
        let Some(group) = groups.iter().find(|g| g.name == s.group && g.active > 0) else {
            warn!("running session in inactive or undefined group '{}'", s.group);
            continue;
        };
        let Some(frac) = eff.get(&group.name).copied().filter(|f| *f > 0.0) else {
            warn!("group '{}' has no effective share", group.name);
            continue;
        };
        if s.servers == 0 {
            warn!("group '{}': no server sessions for active client", group.name);
            continue;
        }
        let ef = frac / group.active as f32 / s.servers as f32;
        weighted.push((s.key.clone(), ef));
    }
    if weighted.is_empty() {
        return InflatePlan::Unchanged;
    }
    weighted.sort_by(|a, b| b.1.total_cmp(&a.1));

    let fractions: Vec<f32> = weighted.iter().map(|(_, f)| *f).collect();
    let aa = alphas(&fractions);
    let ncpu = ncpu.max(1) as f32;
    InflatePlan::PerSession(
        weighted
            .into_iter()
            .zip(aa)
            .map(|((key, _), a)| (key, ((1.0 + a / ncpu) * 1000.0 * overall) as i32))
            .collect(),
    )
}

/// Applies inflate factors to the running sessions of every client
pub struct Scheduler {
    groups: Arc<GroupRegistry>,
    config: ConfigHandle,
    ncpu: usize,
}

impl Scheduler {
    pub fn new(groups: Arc<GroupRegistry>, config: ConfigHandle) -> Self {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { groups, config, ncpu }
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    /// Recompute and deliver; returns the number of sessions notified
    pub fn recompute(&self, clients: &ClientRegistry) -> usize {
        let opts = self.config.load().sched;
        let mut running: Vec<RunningSession<Arc<SessionProxy>>> = Vec::new();
        for client in clients.all() {
            let (workers, masters) = client.server_counts();
            let group = client.group();
            for session in client.sessions() {
                if session.is_busy() {
                    running.push(RunningSession {
                        key: session,
                        group: group.clone(),
                        servers: workers + masters,
                    });
                }
            }
        }

        let groups = self.groups.snapshot();
        match compute(&groups, &running, &opts, self.ncpu) {
            InflatePlan::Unchanged => 0,
            InflatePlan::Uniform(inflate) => running
                .iter()
                .filter(|s| set_inflate(&s.key, inflate))
                .count(),
            InflatePlan::PerSession(factors) => factors
                .iter()
                .filter(|(session, inflate)| set_inflate(session, *inflate))
                .count(),
        }
    }
}

fn set_inflate(session: &SessionProxy, inflate: i32) -> bool {
    let channel = session.with(|st| {
        st.inflate = inflate;
        st.back_channel.clone()
    });
    debug!("session {}: inflate {}", session.id(), inflate);
    channel.is_some_and(|ch| ch.try_send(Response::attn_info(ActionCode::Inflate, inflate)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, priority: f32, fraction: f32, active: i32) -> Group {
        Group {
            priority,
            fraction,
            active,
            ..Group::new(name)
        }
    }

    fn running(key: u32, group: &str) -> RunningSession<u32> {
        RunningSession {
            key,
            group: group.into(),
            servers: 1,
        }
    }

    fn opts(mode: SchedMode, overall: f32) -> SchedOptions {
        SchedOptions {
            enabled: true,
            mode,
            overall,
        }
    }

    fn factor(plan: &InflatePlan<u32>, key: u32) -> i32 {
        match plan {
            InflatePlan::PerSession(f) => f.iter().find(|(k, _)| *k == key).map(|(_, v)| *v).unwrap(),
            other => panic!("expected per-session factors, got {:?}", other),
        }
    }

    // ==================== Gating Tests ====================

    #[test]
    fn test_disabled_or_single_group_does_nothing() {
        let groups = vec![group("default", 1.0, -1.0, 2), group("a", 2.0, -1.0, 1)];
        let sessions = vec![running(1, "default"), running(2, "a")];
        let mut o = opts(SchedMode::Priority, 1.0);
        o.enabled = false;
        assert_eq!(compute(&groups, &sessions, &o, 4), InflatePlan::Unchanged);
        assert_eq!(
            compute(&groups[..1], &sessions, &opts(SchedMode::Priority, 1.0), 4),
            InflatePlan::Unchanged
        );
    }

    #[test]
    fn test_single_running_session_is_neutral() {
        let groups = vec![group("a", 10.0, -1.0, 1), group("b", 5.0, -1.0, 0)];
        let plan = compute(&groups, &[running(1, "a")], &opts(SchedMode::Priority, 1.0), 4);
        assert_eq!(plan, InflatePlan::Uniform(NEUTRAL_INFLATE));
    }

    #[test]
    fn test_equal_priorities_use_overall_only() {
        let groups = vec![group("a", 3.0, -1.0, 1), group("b", 3.0, -1.0, 1)];
        let sessions = vec![running(1, "a"), running(2, "b")];
        assert_eq!(
            compute(&groups, &sessions, &opts(SchedMode::Priority, 1.0), 4),
            InflatePlan::Unchanged
        );
        assert_eq!(
            compute(&groups, &sessions, &opts(SchedMode::Priority, 1.5), 4),
            InflatePlan::Uniform(1500)
        );
    }

    // ==================== Priority Tests ====================

    #[test]
    fn test_higher_priority_is_throttled_less() {
        let groups = vec![group("g1", 10.0, -1.0, 1), group("g2", 5.0, -1.0, 1)];
        let sessions = vec![running(1, "g1"), running(2, "g2")];
        for ncpu in [1, 2, 8] {
            let plan = compute(&groups, &sessions, &opts(SchedMode::Priority, 1.0), ncpu);
            assert!(factor(&plan, 1) <= factor(&plan, 2));
        }
    }

    #[test]
    fn test_two_to_one_priority_values() {
        let groups = vec![group("g1", 10.0, -1.0, 1), group("g2", 5.0, -1.0, 1)];
        let sessions = vec![running(1, "g1"), running(2, "g2")];
        let plan = compute(&groups, &sessions, &opts(SchedMode::Priority, 1.0), 1);
        // Factors are truncated, so float error can cost one unit
        assert!((999..=1000).contains(&factor(&plan, 1)), "{:?}", plan);
        assert!((1999..=2000).contains(&factor(&plan, 2)), "{:?}", plan);
    }

    #[test]
    fn test_unknown_group_is_skipped() {
        let groups = vec![group("g1", 10.0, -1.0, 1), group("g2", 5.0, -1.0, 1)];
        let sessions = vec![running(1, "g1"), running(2, "g2"), running(3, "gone")];
        match compute(&groups, &sessions, &opts(SchedMode::Priority, 1.0), 2) {
            InflatePlan::PerSession(f) => {
                assert_eq!(f.len(), 2);
                assert!(f.iter().all(|(k, _)| *k != 3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    // ==================== Fraction Tests ====================

    #[test]
    fn test_fraction_fills_undeclared_groups() {
        let groups = vec![group("a", 1.0, 60.0, 1), group("b", 1.0, -1.0, 1)];
        let eff = group_fractions(&groups, SchedMode::Fraction).unwrap();
        assert_eq!(eff["a"], 60.0);
        assert_eq!(eff["b"], 40.0);
    }

    #[test]
    fn test_fraction_renormalizes_with_cushion() {
        let groups = vec![
            group("a", 1.0, 100.0, 1),
            group("b", 1.0, 100.0, 1),
            group("c", 1.0, -1.0, 1),
        ];
        let eff = group_fractions(&groups, SchedMode::Fraction).unwrap();
        assert!((eff["a"] - 49.75).abs() < 1e-3);
        assert!((eff["c"] - FRACTION_CUSHION).abs() < 1e-6);

        let sessions = vec![running(1, "a"), running(2, "c")];
        let plan = compute(&groups, &sessions, &opts(SchedMode::Fraction, 1.0), 2);
        assert!(factor(&plan, 1) < factor(&plan, 2));
    }

    #[test]
    fn test_fraction_split_by_active_members_and_servers() {
        let groups = vec![group("a", 1.0, 50.0, 2), group("b", 1.0, 50.0, 1)];
        let mut heavy = running(3, "b");
        heavy.servers = 1;
        let sessions = vec![running(1, "a"), running(2, "a"), heavy];
        let plan = compute(&groups, &sessions, &opts(SchedMode::Fraction, 1.0), 1);
        // Group b has one member holding the whole group share
        assert!(factor(&plan, 3) <= factor(&plan, 1));
        assert_eq!(factor(&plan, 1), factor(&plan, 2));
    }

    // ==================== Alpha Tests ====================

    #[test]
    fn test_alphas_equal_shares_are_zero() {
        let aa = alphas(&[1.0, 1.0, 1.0]);
        assert!(aa.iter().all(|a| a.abs() < 1e-5));
    }
}
