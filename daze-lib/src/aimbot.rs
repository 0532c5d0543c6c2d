//! The dispatcher between the router's verdict and an actual dial: locale
//! roads connect directly, remote and puzzle roads go through the tunnel,
//! fucked roads fail with the blocked error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::context::Ctx;
use crate::error::{DazeError, Result};
use crate::router::{Road, Router};
use crate::stream::{BoxedIo, UdpStream};

/// Bound on every outbound connect, direct or inside the tunnel server.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Split the host out of a `host:port` address, unwrapping IPv6 brackets.
pub fn split_host(address: &str) -> Result<&str> {
    let (host, _port) = address
        .rsplit_once(':')
        .ok_or_else(|| DazeError::Decode(format!("address {address:?} has no port")))?;
    Ok(host.trim_start_matches('[').trim_end_matches(']'))
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, ctx: Ctx, network: Network, address: &str) -> Result<BoxedIo>;
}

/// Direct dialer: connects from the local agent without any tunnel.
pub struct Direct;

#[async_trait]
impl Dialer for Direct {
    async fn dial(&self, ctx: Ctx, network: Network, address: &str) -> Result<BoxedIo> {
        debug!(%ctx, %network, address, "direct dial");
        match network {
            Network::Tcp => {
                let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(address))
                    .await
                    .map_err(|_| {
                        DazeError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("connect to {address} timed out"),
                        ))
                    })??;
                Ok(Box::new(stream))
            }
            Network::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(address).await?;
                Ok(Box::new(UdpStream::new(socket)))
            }
        }
    }
}

/// Router-driven dispatcher over a direct and a tunnel dialer.
pub struct Aimbot {
    router: Box<dyn Router>,
    tunnel: Arc<dyn Dialer>,
}

impl Aimbot {
    pub fn new(router: Box<dyn Router>, tunnel: Arc<dyn Dialer>) -> Self {
        Self { router, tunnel }
    }
}

#[async_trait]
impl Dialer for Aimbot {
    async fn dial(&self, ctx: Ctx, network: Network, address: &str) -> Result<BoxedIo> {
        let host = split_host(address)?;
        let road = self.router.road(host).await;
        debug!(%ctx, host, %road, "routed");
        match road {
            Road::Locale => Direct.dial(ctx, network, address).await,
            Road::Remote | Road::Puzzle => self.tunnel.dial(ctx, network, address).await,
            Road::Fucked => Err(DazeError::Blocked(address.to_string())),
        }
    }
}
