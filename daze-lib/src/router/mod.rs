//! Per-destination routing: every dialed host is classified into one of
//! four roads by a chain of matchers wrapped in an LRU cache.

use std::fmt;

use async_trait::async_trait;

mod cache;
mod ipnet;
mod rules;

pub use cache::RouterCache;
pub use ipnet::{parse_apnic, RouterIpNet};
pub use rules::RouterRules;

/// The routing verdict for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Road {
    /// Direct connect from the local agent.
    Locale,
    /// Send through the tunnel.
    Remote,
    /// Refuse the connection.
    Fucked,
    /// Unknown; the caller decides (the default policy is Remote).
    Puzzle,
}

impl fmt::Display for Road {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Road::Locale => "locale",
            Road::Remote => "remote",
            Road::Fucked => "fucked",
            Road::Puzzle => "puzzle",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait Router: Send + Sync {
    /// Classify a bare host name (no port).
    async fn road(&self, host: &str) -> Road;
}

/// Constant router, used as a terminal default in chains.
pub struct RouterRight(pub Road);

#[async_trait]
impl Router for RouterRight {
    async fn road(&self, _host: &str) -> Road {
        self.0
    }
}

/// Asks each inner router in order and returns the first non-Puzzle
/// verdict.
pub struct RouterChain {
    routers: Vec<Box<dyn Router>>,
}

impl RouterChain {
    pub fn new(routers: Vec<Box<dyn Router>>) -> Self {
        Self { routers }
    }
}

#[async_trait]
impl Router for RouterChain {
    async fn road(&self, host: &str) -> Road {
        for router in &self.routers {
            let road = router.road(host).await;
            if road != Road::Puzzle {
                return road;
            }
        }
        Road::Puzzle
    }
}
