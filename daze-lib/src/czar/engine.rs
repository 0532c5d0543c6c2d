//! The multiplexed tunnel protocol. One long-lived encrypted transport
//! carries every stream: the nonce and cipher are set up once, then each
//! stream opens with the same 12-byte destination header the plain
//! tunnel uses, amortizing the per-connection handshake cost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::aimbot::{Dialer, Direct, Network, DIAL_TIMEOUT};
use crate::ashe::{
    master_key, read_proxy_header, session_key, write_proxy_header, Gravity, HANDSHAKE_TIMEOUT,
    MAX_DST_LEN, NONCE_SIZE,
};
use crate::context::Ctx;
use crate::czar::Mux;
use crate::error::{DazeError, Result};
use crate::stream::{splice, BoxedIo, IoStream};

/// Ceiling for the reconnect backoff delay.
const BACKOFF_CAP: Duration = Duration::from_secs(32);

struct ClientState {
    mux: Option<Arc<Mux>>,
    delay: Duration,
    last_failure: Option<Instant>,
}

/// Tunnel client over one shared mux. A dead transport is replaced with
/// bounded exponential backoff; every stream of the old mux fails when
/// it dies, and cached router verdicts are untouched by a reconnect.
pub struct Client {
    server: String,
    key: [u8; 32],
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(server: impl Into<String>, password: &str) -> Self {
        Self {
            server: server.into(),
            key: master_key(password),
            state: Mutex::new(ClientState {
                mux: None,
                delay: Duration::from_secs(1),
                last_failure: None,
            }),
        }
    }

    /// The live mux, reconnecting if the previous transport died.
    async fn mux(&self) -> Result<Arc<Mux>> {
        let mut state = self.state.lock().await;
        if let Some(mux) = &state.mux {
            if mux.error().is_none() {
                return Ok(mux.clone());
            }
            state.mux = None;
        }
        if let Some(last) = state.last_failure {
            let wait = state.delay.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        match self.connect().await {
            Ok(mux) => {
                let mux = Arc::new(mux);
                state.mux = Some(mux.clone());
                state.delay = Duration::from_secs(1);
                state.last_failure = None;
                Ok(mux)
            }
            Err(e) => {
                warn!(server = %self.server, error = %e, "relay connect failed");
                state.last_failure = Some(Instant::now());
                state.delay = (state.delay * 2).min(BACKOFF_CAP);
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<Mux> {
        let mut conn = timeout(DIAL_TIMEOUT, TcpStream::connect(&self.server))
            .await
            .map_err(|_| {
                DazeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to relay {} timed out", self.server),
                ))
            })??;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce[..]);
        conn.write_all(&nonce).await?;
        let sealed = Gravity::new(conn, &session_key(&nonce, &self.key));
        let (mux, _accept) = Mux::new(Box::new(sealed));
        info!(server = %self.server, "mux transport established");
        Ok(mux)
    }
}

#[async_trait]
impl Dialer for Client {
    async fn dial(&self, ctx: Ctx, network: Network, address: &str) -> Result<BoxedIo> {
        if address.len() > MAX_DST_LEN {
            return Err(DazeError::OversizedDestination(address.len()));
        }
        let mux = self.mux().await?;
        let mut stream = mux.open().await?;
        write_proxy_header(&mut stream, network, address).await?;
        debug!(%ctx, id = stream.id(), address, "mux stream opened");
        Ok(Box::new(stream))
    }
}

/// Tunnel relay for multiplexed transports: one mux per accepted
/// connection, one serve task per accepted stream.
pub struct Server {
    key: [u8; 32],
}

impl Server {
    pub fn new(password: &str) -> Self {
        Self { key: master_key(password) }
    }

    pub async fn serve<T: IoStream + 'static>(&self, ctx: Ctx, mut conn: T) -> Result<()> {
        let mut nonce = [0u8; NONCE_SIZE];
        timeout(HANDSHAKE_TIMEOUT, conn.read_exact(&mut nonce))
            .await
            .map_err(|_| DazeError::Decode("handshake deadline exceeded".into()))??;
        let sealed = Gravity::new(conn, &session_key(&nonce, &self.key));
        let (_mux, mut accept) = Mux::new(Box::new(sealed));

        while let Some(mut stream) = accept.recv().await {
            let sid = stream.id();
            tokio::spawn(async move {
                let served = async {
                    let (network, dst) =
                        match timeout(HANDSHAKE_TIMEOUT, read_proxy_header(&mut stream)).await {
                            Ok(parsed) => parsed?,
                            Err(_) => {
                                return Err(DazeError::Decode(
                                    "stream header deadline exceeded".into(),
                                ))
                            }
                        };
                    info!(%ctx, sid, %network, dst, "mux stream dial");
                    let mut upstream = Direct.dial(ctx, network, &dst).await?;
                    splice(&mut stream, upstream.as_mut()).await?;
                    Ok(())
                }
                .await;
                if let Err(e) = served {
                    warn!(%ctx, sid, error = %e, "mux stream failed");
                }
            });
        }
        info!(%ctx, "mux transport closed");
        Ok(())
    }

    /// Accept loop over a bound listener; one mux per connection.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::testing::spawn_echo;

    async fn spawn_relay(password: &str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(password));
        tokio::spawn(async move {
            let _ = server.run(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn streams_share_one_transport() {
        let echo = spawn_echo().await;
        let relay = spawn_relay("sesame").await;
        let client = Client::new(relay.to_string(), "sesame");

        let mut streams = Vec::new();
        for _ in 0..4 {
            let stream = client
                .dial(Ctx::next(), Network::Tcp, &echo.to_string())
                .await
                .unwrap();
            streams.push(stream);
        }
        for (i, stream) in streams.iter_mut().enumerate() {
            let msg = format!("stream number {i}");
            stream.write_all(msg.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, msg.as_bytes());
        }
    }

    #[tokio::test]
    async fn udp_destinations_work_through_the_mux() {
        let udp_echo = {
            let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                loop {
                    let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                    let _ = socket.send_to(&buf[..n], from).await;
                }
            });
            addr
        };
        let relay = spawn_relay("sesame").await;
        let client = Client::new(relay.to_string(), "sesame");

        let mut stream = client
            .dial(Ctx::next(), Network::Udp, &udp_echo.to_string())
            .await
            .unwrap();
        stream.write_all(b"dns-ish query").await.unwrap();
        let mut buf = [0u8; 13];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"dns-ish query");
    }

    #[tokio::test]
    async fn dead_transport_is_replaced_on_the_next_dial() {
        let echo = spawn_echo().await;

        // A relay that drops its first connection on the floor and
        // serves every later one normally.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let server = Arc::new(Server::new("sesame"));
            let _ = server.run(listener).await;
        });

        let client = Client::new(relay.to_string(), "sesame");
        match client.dial(Ctx::next(), Network::Tcp, &echo.to_string()).await {
            Ok(mut stream) => {
                // The relay end is gone, so the stream fails.
                let mut buf = [0u8; 1];
                assert!(stream.read(&mut buf).await.is_err());
            }
            Err(_) => {} // the transport collapsed mid-dial
        }

        // Give the mux read task a moment to latch the transport error,
        // then dial again: the client reconnects (after its backoff) and
        // the new mux serves the stream.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut stream = None;
        for _ in 0..5 {
            match client.dial(Ctx::next(), Network::Tcp, &echo.to_string()).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        let mut stream = stream.expect("reconnect should eventually serve a dial");
        stream.write_all(b"after reconnect").await.unwrap();
        let mut buf = [0u8; 15];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after reconnect");
    }
}
