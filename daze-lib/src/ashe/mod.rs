//! The base encrypted tunnel protocol. A connection opens with a 128-byte
//! cleartext nonce; everything after it is streamed through the derived
//! per-connection cipher. The client then sends a 12-byte header naming
//! the network kind and the destination, and the relay dials out and
//! splices.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::aimbot::{Dialer, Direct, Network, DIAL_TIMEOUT};
use crate::context::Ctx;
use crate::error::{DazeError, Result};
use crate::stream::{splice, BoxedIo, IoStream};

mod gravity;

pub use gravity::{master_key, session_key, Gravity, NONCE_SIZE};

/// Deadline for the 12-byte header to arrive on a fresh connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

/// Accepted clock skew between client timestamp and server clock.
pub const FRESHNESS_WINDOW: u64 = 120;

/// Longest destination `host:port` the header can carry.
pub const MAX_DST_LEN: usize = 255;

const MAGIC: [u8; 2] = [0xff, 0xff];

const KIND_TCP: u8 = 0x01;
const KIND_UDP: u8 = 0x03;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn kind_byte(network: Network) -> u8 {
    match network {
        Network::Tcp => KIND_TCP,
        Network::Udp => KIND_UDP,
    }
}

/// Write the 12-byte proxy header plus the destination bytes. Fails
/// before sending anything if the destination does not fit the one-byte
/// length field. Shared with the multiplexed tunnel, which carries the
/// same header once per stream.
pub(crate) async fn write_proxy_header<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    network: Network,
    address: &str,
) -> Result<()> {
    if address.len() > MAX_DST_LEN {
        return Err(DazeError::OversizedDestination(address.len()));
    }
    let mut head = [0u8; 12];
    head[..2].copy_from_slice(&MAGIC);
    head[2..10].copy_from_slice(&unix_now().to_be_bytes());
    head[10] = kind_byte(network);
    head[11] = address.len() as u8;
    w.write_all(&head).await?;
    w.write_all(address.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Read and validate the 12-byte proxy header: magic, timestamp
/// freshness, network kind, then the destination bytes.
pub(crate) async fn read_proxy_header<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(Network, String)> {
    let mut head = [0u8; 12];
    r.read_exact(&mut head).await?;
    if head[..2] != MAGIC {
        return Err(DazeError::Decode("bad handshake magic".into()));
    }
    let ts = u64::from_be_bytes([
        head[2], head[3], head[4], head[5], head[6], head[7], head[8], head[9],
    ]);
    if unix_now().abs_diff(ts) > FRESHNESS_WINDOW {
        return Err(DazeError::StaleHandshake);
    }
    let network = match head[10] {
        KIND_TCP => Network::Tcp,
        KIND_UDP => Network::Udp,
        other => return Err(DazeError::Decode(format!("bad network kind {other:#04x}"))),
    };
    let len = head[11] as usize;
    let mut dst = vec![0u8; len];
    r.read_exact(&mut dst).await?;
    let dst = String::from_utf8(dst)
        .map_err(|_| DazeError::Decode("destination is not ASCII".into()))?;
    Ok((network, dst))
}

/// Run the client half of the handshake on an established connection.
pub async fn client_handshake<T: IoStream>(
    conn: T,
    key: &[u8; 32],
    network: Network,
    address: &str,
) -> Result<Gravity<T>> {
    if address.len() > MAX_DST_LEN {
        return Err(DazeError::OversizedDestination(address.len()));
    }
    let mut conn = conn;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill(&mut nonce[..]);
    conn.write_all(&nonce).await?;

    let mut sealed = Gravity::new(conn, &session_key(&nonce, key));
    write_proxy_header(&mut sealed, network, address).await?;
    Ok(sealed)
}

/// Run the server half of the handshake: nonce, cipher, header checks.
/// Returns the sealed stream and the requested destination.
pub async fn accept_handshake<T: IoStream>(
    mut conn: T,
    key: &[u8; 32],
) -> Result<(Gravity<T>, Network, String)> {
    let mut nonce = [0u8; NONCE_SIZE];
    conn.read_exact(&mut nonce).await?;

    let mut sealed = Gravity::new(conn, &session_key(&nonce, key));
    let (network, dst) = read_proxy_header(&mut sealed).await?;
    Ok((sealed, network, dst))
}

/// Tunnel client: each dial opens a fresh connection to the relay and
/// performs the full handshake on it.
pub struct Client {
    server: String,
    key: [u8; 32],
}

impl Client {
    pub fn new(server: impl Into<String>, password: &str) -> Self {
        Self { server: server.into(), key: master_key(password) }
    }
}

#[async_trait]
impl Dialer for Client {
    async fn dial(&self, _ctx: Ctx, network: Network, address: &str) -> Result<BoxedIo> {
        let conn = timeout(DIAL_TIMEOUT, TcpStream::connect(&self.server))
            .await
            .map_err(|_| {
                DazeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to relay {} timed out", self.server),
                ))
            })??;
        let sealed = client_handshake(conn, &self.key, network, address).await?;
        Ok(Box::new(sealed))
    }
}

/// Tunnel relay: verifies handshakes, dials the real destination and
/// splices. One failed handshake never takes the listener down.
pub struct Server {
    key: [u8; 32],
}

impl Server {
    pub fn new(password: &str) -> Self {
        Self { key: master_key(password) }
    }

    pub async fn serve<T: IoStream>(&self, ctx: Ctx, conn: T) -> Result<()> {
        let (mut sealed, network, dst) =
            match timeout(HANDSHAKE_TIMEOUT, accept_handshake(conn, &self.key)).await {
                Ok(Ok(parts)) => parts,
                Ok(Err(e)) => {
                    warn!(%ctx, error = %e, "handshake rejected");
                    return Err(e);
                }
                Err(_) => {
                    warn!(%ctx, "handshake deadline exceeded");
                    return Err(DazeError::Decode("handshake deadline exceeded".into()));
                }
            };
        info!(%ctx, %network, dst, "tunnel dial");
        let mut upstream = Direct.dial(ctx, network, &dst).await?;
        let (tx, rx) = splice(&mut sealed, upstream.as_mut()).await?;
        info!(%ctx, tx, rx, "tunnel closed");
        Ok(())
    }

    /// Accept loop over a bound listener; one task per connection.
    pub async fn run(self: std::sync::Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
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
            let server = self.clone();
            tokio::spawn(async move {
                let _ = server.serve(ctx, conn).await;
            });
        }
    }
}
