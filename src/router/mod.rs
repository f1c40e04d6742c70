//! Read/Write Router: chooses primary vs. a replica by
//! operation kind and manual override.

use crate::connector::config::Balancer;
use crate::connector::Queryable;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Whether a terminal operation reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

/// A manual per-query override of the router's default pick.
#[derive(Debug, Clone, Copy, Default)]
pub enum RouteOverride {
    #[default]
    None,
    Primary,
    Replica(usize),
}

/// Why a particular connection was chosen, surfaced for the routing
/// `debug` span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    Forced,
    Balancer,
    TransactionBound,
    NoReplicas,
}

pub struct Router {
    primary: Arc<dyn Queryable>,
    replicas: Vec<Arc<dyn Queryable>>,
    balancer: Balancer,
    round_robin: AtomicUsize,
}

impl Router {
    pub fn new(primary: Arc<dyn Queryable>, replicas: Vec<Arc<dyn Queryable>>, balancer: Balancer) -> Self {
        Self { primary, replicas, balancer, round_robin: AtomicUsize::new(0) }
    }

    pub fn primary(&self) -> &Arc<dyn Queryable> {
        &self.primary
    }

    /// Pick a connection for an operation of `kind`, honoring
    /// `override_` where it applies. Writes always go to the primary
    /// regardless of override.
    pub fn route(&self, kind: OperationKind, override_: RouteOverride) -> (Arc<dyn Queryable>, RouteReason) {
        if kind == OperationKind::Write {
            tracing::debug!(target: "entity_query::router", route = "primary", reason = "write", "routed query");
            return (self.primary.clone(), RouteReason::Forced);
        }

        let (conn, reason) = match override_ {
            RouteOverride::Primary => (self.primary.clone(), RouteReason::Forced),
            RouteOverride::Replica(i) => match self.replicas.get(i) {
                Some(r) => (r.clone(), RouteReason::Forced),
                None => self.balancer_pick(),
            },
            RouteOverride::None => self.balancer_pick(),
        };

        tracing::debug!(target: "entity_query::router", reason = ?reason, "routed query");
        (conn, reason)
    }

    fn balancer_pick(&self) -> (Arc<dyn Queryable>, RouteReason) {
        if self.replicas.is_empty() {
            return (self.primary.clone(), RouteReason::NoReplicas);
        }

        let idx = match self.balancer {
            Balancer::RoundRobin => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.replicas.len(),
            Balancer::Random => rand::thread_rng().gen_range(0..self.replicas.len()),
        };
        (self.replicas[idx].clone(), RouteReason::Balancer)
    }
}
