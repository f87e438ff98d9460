//! Load-balancing policies over the upstream server list.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::BalancerKind;
use crate::server::Server;

/// Picks the upstream server for the next client connection. Implementations
/// never come up empty as long as the server list is non-empty, which init
/// guarantees.
pub trait LoadBalancer: Send + Sync {
    fn pick(&self) -> Arc<Server>;
}

/// Build the selected policy over a shared server list.
#[must_use]
pub fn from_kind(kind: BalancerKind, servers: Arc<Vec<Arc<Server>>>) -> Box<dyn LoadBalancer> {
    match kind {
        BalancerKind::RoundRobin => Box::new(RoundRobin::new(servers)),
        BalancerKind::UniformRandom => Box::new(UniformRandom::new(servers)),
        BalancerKind::LeastUsed => Box::new(LeastUsed::new(servers)),
    }
}

/// Cycles through the server list. The cursor advances before each pick, so
/// the first server handed out is index 1.
pub struct RoundRobin {
    servers: Arc<Vec<Arc<Server>>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    #[must_use]
    pub fn new(servers: Arc<Vec<Arc<Server>>>) -> Self {
        Self {
            servers,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobin {
    fn pick(&self) -> Arc<Server> {
        let next = (self.cursor.fetch_add(1, Ordering::Relaxed) + 1) % self.servers.len();
        Arc::clone(&self.servers[next])
    }
}

/// Picks uniformly at random over the full server list.
pub struct UniformRandom {
    servers: Arc<Vec<Arc<Server>>>,
}

impl UniformRandom {
    #[must_use]
    pub fn new(servers: Arc<Vec<Arc<Server>>>) -> Self {
        Self { servers }
    }
}

impl LoadBalancer for UniformRandom {
    fn pick(&self) -> Arc<Server> {
        let index = rand::rng().random_range(0..self.servers.len());
        Arc::clone(&self.servers[index])
    }
}

/// Picks the server with the lowest byte rate over the last minute, skipping
/// servers with a connect failure in the last second. Ties go to the earliest
/// server in the list.
pub struct LeastUsed {
    servers: Arc<Vec<Arc<Server>>>,
}

impl LeastUsed {
    #[must_use]
    pub fn new(servers: Arc<Vec<Arc<Server>>>) -> Self {
        Self { servers }
    }
}

impl LoadBalancer for LeastUsed {
    fn pick(&self) -> Arc<Server> {
        let mut least_used: Option<&Arc<Server>> = None;
        let mut least_byte_rate = u64::MAX;
        for server in self.servers.iter() {
            if server.failed().last_second() == 0
                && server.byte_rate().last_minute() < least_byte_rate
            {
                least_byte_rate = server.byte_rate().last_minute();
                least_used = Some(server);
            }
        }

        match least_used {
            Some(server) => Arc::clone(server),
            // Every server failed within the last second; fall back to a
            // random one.
            None => {
                let index = rand::rng().random_range(0..self.servers.len());
                Arc::clone(&self.servers[index])
            }
        }
    }
}
