//! The HTTP-masquerade carrier: the encrypted tunnel rides inside what
//! looks like an ordinary HTTP exchange. Authorized requests get a fixed
//! 200 response header and the raw stream is handed to the tunnel
//! server; everything else is reverse-proxied to the masker site, so a
//! probe sees a normal website.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use httpdate::fmt_http_date;
use md5::{Digest, Md5};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::aimbot::{Dialer, Network, DIAL_TIMEOUT};
use crate::ashe;
use crate::context::Ctx;
use crate::error::{DazeError, Result};
use crate::stream::{splice, BoxedIo};

/// Decoded authorization record: 16 random bytes then their signature.
const AUTH_LEN: usize = 32;
const AUTH_RANDOM_LEN: usize = 16;

/// Rendered length of the fixed response header. The `Date` field uses
/// the fixed-width IMF format, so every rendering has the same size and
/// the client can consume exactly this many bytes.
pub const RESPONSE_LEN: usize = 149;

fn response_header() -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Length: 0\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Date: {}\r\n\
         X-Content-Type-Options: nosniff\r\n\
         \r\n",
        fmt_http_date(SystemTime::now())
    )
}

/// `host:port` of a masker URL; the scheme and path are dropped and the
/// port defaults to 80.
fn masker_address(url: &str) -> String {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    }
}

fn sign(random: &[u8], key: &[u8; 32]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(random);
    hasher.update(&key[..AUTH_RANDOM_LEN]);
    hasher.finalize().into()
}

/// Masquerade relay: an HTTP front over the tunnel server.
pub struct Server {
    key: [u8; 32],
    tunnel: ashe::Server,
    masker: String,
}

impl Server {
    pub fn new(password: &str, masker: &str) -> Self {
        Self {
            key: ashe::master_key(password),
            tunnel: ashe::Server::new(password),
            masker: masker_address(masker),
        }
    }

    fn authorized(&self, value: &str) -> bool {
        let Ok(record) = hex::decode(value) else {
            return false;
        };
        if record.len() != AUTH_LEN {
            return false;
        }
        let (random, signature) = record.split_at(AUTH_RANDOM_LEN);
        sign(random, &self.key) == signature
    }

    pub async fn serve(&self, ctx: Ctx, conn: TcpStream) -> Result<()> {
        let mut client = BufReader::new(conn);
        let mut head = Vec::new();
        let mut authorization = None;
        loop {
            let mut line = String::new();
            if client.read_line(&mut line).await? == 0 {
                return Err(DazeError::Decode("request head truncated".into()));
            }
            if let Some(value) = line
                .trim_end()
                .split_once(':')
                .filter(|(name, _)| name.trim().eq_ignore_ascii_case("Authorization"))
                .map(|(_, value)| value.trim().to_string())
            {
                authorization = Some(value);
            }
            let done = line.trim_end().is_empty();
            head.push(line);
            if done {
                break;
            }
        }

        match authorization {
            Some(value) if self.authorized(&value) => {
                info!(%ctx, "masquerade authorized, hijacking");
                client.write_all(response_header().as_bytes()).await?;
                client.flush().await?;
                self.tunnel.serve(ctx, client).await
            }
            _ => self.mask(ctx, client, head).await,
        }
    }

    /// Replay the request to the masker site and return its response
    /// verbatim. Only the `Host` header is rewritten.
    async fn mask(
        &self,
        ctx: Ctx,
        mut client: BufReader<TcpStream>,
        head: Vec<String>,
    ) -> Result<()> {
        info!(%ctx, masker = %self.masker, "unauthorized request, masking");
        let mut upstream = timeout(DIAL_TIMEOUT, TcpStream::connect(&self.masker))
            .await
            .map_err(|_| {
                DazeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to masker {} timed out", self.masker),
                ))
            })??;
        let host = self.masker.trim_end_matches(":80");
        for line in &head {
            if line
                .split_once(':')
                .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case("Host"))
            {
                upstream.write_all(format!("Host: {host}\r\n").as_bytes()).await?;
            } else {
                upstream.write_all(line.as_bytes()).await?;
            }
        }
        splice(&mut client, &mut upstream).await?;
        Ok(())
    }

    /// Accept loop over a bound listener; one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
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

/// Masquerade client: POST with a signed `Authorization`, consume the
/// fixed response header, then run the tunnel handshake on the socket.
pub struct Client {
    server: String,
    key: [u8; 32],
}

impl Client {
    pub fn new(server: impl Into<String>, password: &str) -> Self {
        Self { server: server.into(), key: ashe::master_key(password) }
    }

    fn authorization(&self) -> String {
        let mut random = [0u8; AUTH_RANDOM_LEN];
        rand::thread_rng().fill(&mut random[..]);
        let signature = sign(&random, &self.key);
        format!("{}{}", hex::encode(random), hex::encode(signature))
    }

    pub(crate) fn forge_request(&self, host: &str) -> String {
        format!(
            "POST / HTTP/1.1\r\n\
             Host: {host}\r\n\
             Authorization: {}\r\n\
             Content-Length: 0\r\n\
             \r\n",
            self.authorization()
        )
    }
}

#[async_trait]
impl Dialer for Client {
    async fn dial(&self, _ctx: Ctx, network: Network, address: &str) -> Result<BoxedIo> {
        let mut conn = timeout(DIAL_TIMEOUT, TcpStream::connect(&self.server))
            .await
            .map_err(|_| {
                DazeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to relay {} timed out", self.server),
                ))
            })??;
        let host = self.server.clone();
        conn.write_all(self.forge_request(&host).as_bytes()).await?;
        let mut response = [0u8; RESPONSE_LEN];
        conn.read_exact(&mut response).await?;
        let sealed = ashe::client_handshake(conn, &self.key, network, address).await?;
        Ok(Box::new(sealed))
    }
}
