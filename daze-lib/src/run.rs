//! Wiring: turn a validated configuration into a running local agent or
//! relay.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::aimbot::{Aimbot, Dialer};
use crate::config::{Config, Protocol, RoutingMode};
use crate::error::{DazeError, Result};
use crate::ingress::Locale;
use crate::resolver;
use crate::router::{
    Road, Router, RouterCache, RouterChain, RouterIpNet, RouterRight, RouterRules,
};
use crate::{ashe, baboon, czar};

/// Run the remote relay until the listener fails.
pub async fn server(cfg: Config) -> Result<()> {
    let listener = TcpListener::bind(&cfg.listen).await?;
    info!(listen = %cfg.listen, protocol = ?cfg.protocol, "relay up");
    match cfg.protocol {
        Protocol::Ashe => Arc::new(ashe::Server::new(&cfg.password)).run(listener).await,
        Protocol::Baboon => {
            Arc::new(baboon::Server::new(&cfg.password, &cfg.masker))
                .run(listener)
                .await
        }
        Protocol::Czar => Arc::new(czar::Server::new(&cfg.password)).run(listener).await,
    }
}

/// Run the local agent until the listener fails.
pub async fn client(cfg: Config) -> Result<()> {
    let server = cfg
        .server
        .clone()
        .ok_or_else(|| DazeError::Config("client needs a server address".into()))?;
    let tunnel: Arc<dyn Dialer> = match cfg.protocol {
        Protocol::Ashe => Arc::new(ashe::Client::new(server, &cfg.password)),
        Protocol::Baboon => Arc::new(baboon::Client::new(server, &cfg.password)),
        Protocol::Czar => Arc::new(czar::Client::new(server, &cfg.password)),
    };
    let router = build_router(&cfg)?;
    let listener = TcpListener::bind(&cfg.listen).await?;
    info!(listen = %cfg.listen, protocol = ?cfg.protocol, mode = ?cfg.mode, "local agent up");
    Locale::new(Arc::new(Aimbot::new(router, tunnel)))
        .run(listener)
        .await
}

/// The standard router compositions: everything is wrapped in the LRU
/// cache except the trivial locale-all mode.
fn build_router(cfg: &Config) -> Result<Box<dyn Router>> {
    let resolver = resolver::for_environment(cfg.android);
    let router: Box<dyn Router> = match cfg.mode {
        RoutingMode::Locale => Box::new(RouterRight(Road::Locale)),
        RoutingMode::Remote => Box::new(RouterCache::new(RouterChain::new(vec![
            Box::new(RouterIpNet::reserved(resolver)),
            Box::new(RouterRight(Road::Remote)),
        ]))),
        RoutingMode::Rule => {
            let rules = match &cfg.rule_file {
                Some(path) => RouterRules::from_reader(BufReader::new(File::open(path)?))?,
                None => RouterRules::new(),
            };
            let cidr = match &cfg.cidr_file {
                Some(path) => RouterIpNet::from_reader(
                    BufReader::new(File::open(path)?),
                    resolver.clone(),
                )?,
                None => RouterIpNet::reserved(resolver),
            };
            Box::new(RouterCache::new(RouterChain::new(vec![
                Box::new(rules),
                Box::new(cidr),
                Box::new(RouterRight(Road::Remote)),
            ])))
        }
    };
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;

    fn base_config() -> Config {
        Config {
            role: Role::Client,
            listen: "127.0.0.1:0".into(),
            server: Some("127.0.0.1:1".into()),
            password: "p".into(),
            protocol: Protocol::Ashe,
            mode: RoutingMode::Remote,
            rule_file: None,
            cidr_file: None,
            masker: "http://example.com".into(),
            android: false,
        }
    }

    #[tokio::test]
    async fn remote_mode_keeps_reserved_ranges_local() {
        let router = build_router(&base_config()).unwrap();
        assert_eq!(router.road("192.168.0.10").await, Road::Locale);
        assert_eq!(router.road("93.184.216.34").await, Road::Remote);
    }

    #[tokio::test]
    async fn locale_mode_routes_everything_local() {
        let mut cfg = base_config();
        cfg.mode = RoutingMode::Locale;
        let router = build_router(&cfg).unwrap();
        assert_eq!(router.road("93.184.216.34").await, Road::Locale);
    }
}
