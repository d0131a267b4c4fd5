use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::service::ServiceNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
}

/// Client-side endpoint selection over a discovered list.
#[derive(Debug)]
pub struct Balancer {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl Balancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn round_robin() -> Self {
        Self::new(Strategy::RoundRobin)
    }

    pub fn random() -> Self {
        Self::new(Strategy::Random)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick one endpoint, or `None` when there are no providers.
    pub fn pick<'a>(&self, nodes: &'a [ServiceNode]) -> Option<&'a ServiceNode> {
        if nodes.is_empty() {
            return None;
        }
        let idx = match self.strategy {
            Strategy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len(),
            Strategy::Random => rand::thread_rng().gen_range(0..nodes.len()),
        };
        nodes.get(idx)
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Self::round_robin()
    }
}
