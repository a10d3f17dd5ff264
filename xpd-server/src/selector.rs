//! Worker selection for GetWorkers
//!
//! The selector picks, for a new master session, the nodes its workers
//! run on. Entry 0 of the node list is always this master and is always
//! selected first.

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ResourceConfig, SelectionMode};
use crate::topology::{ClusterNode, NodeKind};

/// Load information used by load-based selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionContext {
    /// Priority of the requesting session's group
    pub group_priority: f32,
    /// Sum of the group priorities of all active sessions
    pub summed_priority: f32,
    /// Number of active sessions
    pub running_sessions: usize,
}

impl Default for SelectionContext {
    fn default() -> Self {
        Self {
            group_priority: 1.0,
            summed_priority: 0.0,
            running_sessions: 0,
        }
    }
}

impl SelectionContext {
    /// Share of the free nodes granted to the requester
    pub fn priority(&self) -> f32 {
        if self.summed_priority > 0.0 {
            self.group_priority * self.running_sessions as f32 / self.summed_priority
        } else {
            1.0
        }
    }
}

/// Pluggable worker selection
pub trait WorkerSelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Indices into `nodes` of the selected entries, master first
    fn select(
        &self,
        nodes: &[ClusterNode],
        resource: &ResourceConfig,
        ctx: &SelectionContext,
    ) -> Result<Vec<usize>, String>;

    /// Status line for QueryWorkers
    fn export_info(&self, nodes: &[ClusterNode], resource: &ResourceConfig) -> String {
        let mut info = format!("Selection: {}", resource.selection.label());
        if resource.selection != SelectionMode::All {
            info.push_str(&format!(", max workers: {} &", resource.max_workers));
        }
        for node in nodes {
            let port = match node.port {
                Some(p) => format!(":{}", p),
                None => "     ".to_string(),
            };
            info.push_str(&format!(
                "{}: {}{}  sessions: {} &",
                node.kind.code(),
                node.host,
                port,
                node.active
            ));
        }
        info
    }
}

/// Round-robin, random or load-based selection over the static node list
#[derive(Debug)]
pub struct DefaultSelector {
    next: Mutex<usize>,
}

impl Default for DefaultSelector {
    fn default() -> Self {
        Self { next: Mutex::new(1) }
    }
}

impl DefaultSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn load_based(nodes: &[ClusterNode], resource: &ResourceConfig, ctx: &SelectionContext) -> Vec<usize> {
        let free = nodes
            .iter()
            .skip(1)
            .filter(|n| n.kind != NodeKind::Master && (n.active as i32) < resource.opt_workers_per_unit)
            .count();
        let wanted = (free as f32 * resource.nodes_fraction * ctx.priority()) as i32 + resource.min_for_query;
        let wanted = (wanted.max(0) as usize).min(nodes.len() - 1);
        debug!("load-based selection: {} free, {} wanted", free, wanted);

        let mut order: Vec<usize> = (1..nodes.len()).collect();
        order.sort_by_key(|&i| nodes[i].active);
        let mut picked = vec![0];
        picked.extend(order.into_iter().take(wanted));
        picked
    }

    fn random(nodes: &[ClusterNode], max: usize) -> Result<Vec<usize>, String> {
        let most = nodes.iter().skip(1).map(|n| n.active).max().unwrap_or(0);
        // Less loaded nodes weigh more
        let mut weights: Vec<u32> = nodes.iter().map(|n| most.saturating_sub(n.active) + 1).collect();
        weights[0] = 0;

        let mut picked = vec![0];
        for _ in 0..max {
            let total: u32 = weights.iter().sum();
            if total == 0 {
                return Err("random generation failed".into());
            }
            let mut draw = fastrand::u32(0..total);
            let mut chosen = 0;
            for (i, w) in weights.iter().enumerate() {
                if draw < *w {
                    chosen = i;
                    break;
                }
                draw -= w;
            }
            weights[chosen] -= 1;
            picked.push(chosen);
        }
        Ok(picked)
    }

    fn round_robin(&self, nodes: &[ClusterNode], max: usize) -> Vec<usize> {
        let mut next = self.next.lock();
        let mut picked = vec![0];
        for _ in 0..max {
            if *next >= nodes.len() {
                *next = 1;
            }
            picked.push(*next);
            *next += 1;
        }
        picked
    }
}

impl WorkerSelector for DefaultSelector {
    fn name(&self) -> &'static str {
        "default"
    }

    fn select(
        &self,
        nodes: &[ClusterNode],
        resource: &ResourceConfig,
        ctx: &SelectionContext,
    ) -> Result<Vec<usize>, String> {
        if nodes.len() <= 1 {
            return Err("no worker found".into());
        }
        if resource.selection == SelectionMode::LoadBased {
            return Ok(Self::load_based(nodes, resource, ctx));
        }

        let limited = resource.selection != SelectionMode::All
            && resource.max_workers > 0
            && (resource.max_workers as usize) < nodes.len();
        if !limited {
            return Ok((0..nodes.len()).collect());
        }
        let max = resource.max_workers as usize;
        match resource.selection {
            SelectionMode::Random => Self::random(nodes, max),
            _ => Ok(self.round_robin(nodes, max)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(actives: &[u32]) -> Vec<ClusterNode> {
        let mut nodes = vec![ClusterNode::new(NodeKind::Master, "lxb01")];
        for (i, a) in actives.iter().enumerate() {
            let mut n = ClusterNode::new(NodeKind::Worker, format!("w{}", i + 1));
            n.active = *a;
            nodes.push(n);
        }
        nodes
    }

    fn resource(selection: SelectionMode, max_workers: i32) -> ResourceConfig {
        ResourceConfig {
            selection,
            max_workers,
            ..ResourceConfig::default()
        }
    }

    // ==================== Selection Tests ====================

    #[test]
    fn test_too_few_nodes() {
        let selector = DefaultSelector::new();
        let nodes = cluster(&[]);
        assert!(selector
            .select(&nodes, &resource(SelectionMode::All, -1), &SelectionContext::default())
            .is_err());
    }

    #[test]
    fn test_all_when_unlimited() {
        let selector = DefaultSelector::new();
        let nodes = cluster(&[0, 0, 0]);
        let picked = selector
            .select(&nodes, &resource(SelectionMode::RoundRobin, -1), &SelectionContext::default())
            .unwrap();
        assert_eq!(picked, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_round_robin_wraps() {
        let selector = DefaultSelector::new();
        let nodes = cluster(&[0, 0, 0]);
        let res = resource(SelectionMode::RoundRobin, 2);
        let ctx = SelectionContext::default();
        assert_eq!(selector.select(&nodes, &res, &ctx).unwrap(), vec![0, 1, 2]);
        assert_eq!(selector.select(&nodes, &res, &ctx).unwrap(), vec![0, 3, 1]);
        assert_eq!(selector.select(&nodes, &res, &ctx).unwrap(), vec![0, 2, 3]);
    }

    #[test]
    fn test_random_prefers_idle_nodes() {
        let selector = DefaultSelector::new();
        // w1 is busy: its weight is 1 against 6 for w2 and w3
        let nodes = cluster(&[5, 0, 0]);
        let res = resource(SelectionMode::Random, 2);
        let picked = selector.select(&nodes, &res, &SelectionContext::default()).unwrap();
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0], 0);
        assert!(picked[1..].iter().all(|&i| (1..4).contains(&i)));
    }

    #[test]
    fn test_load_based_picks_least_loaded() {
        let selector = DefaultSelector::new();
        let nodes = cluster(&[3, 0, 1, 5]);
        let res = ResourceConfig {
            selection: SelectionMode::LoadBased,
            nodes_fraction: 0.5,
            opt_workers_per_unit: 2,
            min_for_query: 1,
            ..ResourceConfig::default()
        };
        // two free nodes: (2 * 0.5 * 1) + 1 = 2 workers
        let picked = selector.select(&nodes, &res, &SelectionContext::default()).unwrap();
        assert_eq!(picked, vec![0, 2, 3]);
    }

    #[test]
    fn test_load_based_capped() {
        let selector = DefaultSelector::new();
        let nodes = cluster(&[0, 0]);
        let res = ResourceConfig {
            selection: SelectionMode::LoadBased,
            min_for_query: 10,
            ..ResourceConfig::default()
        };
        let picked = selector.select(&nodes, &res, &SelectionContext::default()).unwrap();
        assert_eq!(picked, vec![0, 1, 2]);
    }

    #[test]
    fn test_context_priority() {
        let ctx = SelectionContext {
            group_priority: 2.0,
            summed_priority: 4.0,
            running_sessions: 3,
        };
        assert!((ctx.priority() - 1.5).abs() < 1e-6);
        assert_eq!(SelectionContext::default().priority(), 1.0);
    }

    // ==================== Export Tests ====================

    #[test]
    fn test_export_info() {
        let selector = DefaultSelector::new();
        let mut nodes = cluster(&[1]);
        nodes[1].port = Some(2093);
        let info = selector.export_info(&nodes, &resource(SelectionMode::RoundRobin, 4));
        let pad = " ".repeat(7);
        assert_eq!(
            info,
            format!(
                "Selection: round-robin, max workers: 4 &M: lxb01{}sessions: 0 &W: w1:2093  sessions: 1 &",
                pad
            )
        );
        let all = selector.export_info(&nodes[..1], &resource(SelectionMode::All, -1));
        assert_eq!(all, format!("Selection: allM: lxb01{}sessions: 0 &", pad));
    }
}
