//! The local ingress: accepts ordinary proxy traffic, autodetects the
//! client protocol from the first byte, decodes it down to a destination
//! `host:port` and hands the dial to the downstream dialer.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::aimbot::Dialer;
use crate::context::Ctx;
use crate::error::Result;

mod http;
mod socks4;
mod socks5;

/// The local proxy server. One accept loop, one task per connection;
/// a failing connection never takes the listener down.
pub struct Locale<D> {
    dialer: Arc<D>,
}

impl<D: Dialer + 'static> Locale<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self { dialer }
    }

    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (conn, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            let ctx = Ctx::next();
            info!(%ctx, %addr, "accepted connection");
            let dialer = self.dialer.clone();
            tokio::spawn(async move {
                match serve(dialer.as_ref(), ctx, conn).await {
                    Ok(()) => info!(%ctx, "connection closed"),
                    Err(e) => warn!(%ctx, error = %e, "connection failed"),
                }
            });
        }
    }
}

/// Peek the first byte and dispatch: 0x05 SOCKS5, 0x04 SOCKS4, anything
/// else is treated as HTTP.
async fn serve<D: Dialer>(dialer: &D, ctx: Ctx, conn: TcpStream) -> Result<()> {
    let mut client = BufReader::new(conn);
    let head = client.fill_buf().await?;
    let first = match head.first() {
        Some(b) => *b,
        None => return Ok(()), // closed before sending anything
    };
    match first {
        0x05 => socks5::serve(dialer, ctx, &mut client).await,
        0x04 => socks4::serve(dialer, ctx, &mut client).await,
        _ => http::serve(dialer, ctx, &mut client).await,
    }
}
