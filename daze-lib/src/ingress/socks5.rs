//! SOCKS5 decoder: no-authentication greeting, CONNECT and UDP
//! ASSOCIATE. BIND gets an error reply instead of a connection. The UDP
//! relay keeps a small LRU of upstream sockets, one per destination,
//! each with a reader task that re-attaches the SOCKS5 UDP header
//! captured from that destination's first client packet.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aimbot::{Dialer, Network};
use crate::context::Ctx;
use crate::error::{DazeError, Result};
use crate::stream::{splice, BoxedIo};

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Upstream sockets kept per UDP relay session.
const UDP_PEER_CAPACITY: usize = 8;

pub async fn serve<D: Dialer>(
    dialer: &D,
    ctx: Ctx,
    client: &mut BufReader<TcpStream>,
) -> Result<()> {
    let _version = client.read_u8().await?;
    let nmethods = client.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let version = client.read_u8().await?;
    if version != 0x05 {
        return Err(DazeError::Decode(format!("bad socks5 version {version:#04x}")));
    }
    let command = client.read_u8().await?;
    let _reserved = client.read_u8().await?;
    let dst = read_address(client).await?;

    match command {
        CMD_CONNECT => connect(dialer, ctx, client, &dst).await,
        CMD_UDP_ASSOCIATE => udp_associate(dialer, ctx, client).await,
        CMD_BIND => {
            reply(client, REP_COMMAND_NOT_SUPPORTED, 0).await?;
            Err(DazeError::Decode("socks5 bind unsupported".into()))
        }
        other => {
            reply(client, REP_COMMAND_NOT_SUPPORTED, 0).await?;
            Err(DazeError::Decode(format!("bad socks5 command {other:#04x}")))
        }
    }
}

async fn read_address(client: &mut BufReader<TcpStream>) -> Result<String> {
    let atyp = client.read_u8().await?;
    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            client.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| DazeError::Decode("socks5 domain is not ASCII".into()))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            client.read_exact(&mut addr).await?;
            format!("[{}]", Ipv6Addr::from(addr))
        }
        other => {
            return Err(DazeError::Decode(format!(
                "bad socks5 address type {other:#04x}"
            )))
        }
    };
    let port = client.read_u16().await?;
    Ok(format!("{host}:{port}"))
}

async fn reply(client: &mut BufReader<TcpStream>, code: u8, bnd_port: u16) -> Result<()> {
    let mut out = [0x05, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    out[8..].copy_from_slice(&bnd_port.to_be_bytes());
    client.write_all(&out).await?;
    client.flush().await?;
    Ok(())
}

async fn connect<D: Dialer>(
    dialer: &D,
    ctx: Ctx,
    client: &mut BufReader<TcpStream>,
    dst: &str,
) -> Result<()> {
    info!(%ctx, dst, "socks5 connect");
    match dialer.dial(ctx, Network::Tcp, dst).await {
        Ok(mut upstream) => {
            reply(client, REP_SUCCEEDED, 0).await?;
            splice(client, upstream.as_mut()).await?;
            Ok(())
        }
        Err(e) => {
            reply(client, REP_GENERAL_FAILURE, 0).await?;
            Err(e)
        }
    }
}

/// One upstream of the UDP relay: the write half feeds client datagrams
/// out, the reader task feeds replies back with the captured header.
/// Dropping the peer (LRU eviction or relay end) closes both.
struct UdpPeer {
    write: WriteHalf<BoxedIo>,
    reader: JoinHandle<()>,
}

impl Drop for UdpPeer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn udp_associate<D: Dialer>(
    dialer: &D,
    ctx: Ctx,
    client: &mut BufReader<TcpStream>,
) -> Result<()> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let bnd_port = socket.local_addr()?.port();
    reply(client, REP_SUCCEEDED, bnd_port).await?;
    info!(%ctx, bnd_port, "socks5 udp associate");

    // The relay lives exactly as long as the TCP control connection.
    tokio::select! {
        res = relay(dialer, ctx, &socket) => res,
        res = watch_control(client) => res,
    }
}

async fn watch_control(client: &mut BufReader<TcpStream>) -> Result<()> {
    let mut buf = [0u8; 512];
    loop {
        if client.read(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

async fn relay<D: Dialer>(dialer: &D, ctx: Ctx, socket: &Arc<UdpSocket>) -> Result<()> {
    let capacity = NonZeroUsize::new(UDP_PEER_CAPACITY).unwrap_or(NonZeroUsize::MIN);
    let mut peers: LruCache<String, UdpPeer> = LruCache::new(capacity);
    let mut buf = [0u8; 2048];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let (header_len, dst) = match parse_udp_header(&buf[..n]) {
            Some(parsed) => parsed,
            None => {
                debug!(%ctx, "dropping unparsable or fragmented udp packet");
                continue;
            }
        };
        if !peers.contains(&dst) {
            let upstream = match dialer.dial(ctx, Network::Udp, &dst).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    warn!(%ctx, dst, error = %e, "udp upstream dial failed");
                    continue;
                }
            };
            let (read_half, write_half) = tokio::io::split(upstream);
            let reader = spawn_peer_reader(socket.clone(), read_half, buf[..header_len].to_vec(), from);
            if let Some((evicted, _)) = peers.push(dst.clone(), UdpPeer { write: write_half, reader })
            {
                debug!(%ctx, dst = evicted, "udp peer evicted");
            }
        }
        if let Some(peer) = peers.get_mut(&dst) {
            if peer.write.write_all(&buf[header_len..n]).await.is_err() {
                peers.pop(&dst);
            }
        }
    }
}

fn spawn_peer_reader(
    socket: Arc<UdpSocket>,
    mut read_half: ReadHalf<BoxedIo>,
    header: Vec<u8>,
    app: std::net::SocketAddr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            match read_half.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    let mut packet = header.clone();
                    packet.extend_from_slice(&buf[..n]);
                    if socket.send_to(&packet, app).await.is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    })
}

/// Parse `[RSV:2][FRAG:1][ATYP:1][ADDR][PORT:2]`, returning the header
/// length and the destination. Fragmented packets yield `None`.
fn parse_udp_header(packet: &[u8]) -> Option<(usize, String)> {
    if packet.len() < 4 || packet[2] != 0 {
        return None;
    }
    let (host, header_len) = match packet[3] {
        ATYP_IPV4 => {
            if packet.len() < 10 {
                return None;
            }
            let addr: [u8; 4] = packet[4..8].try_into().ok()?;
            (Ipv4Addr::from(addr).to_string(), 10)
        }
        ATYP_DOMAIN => {
            let len = *packet.get(4)? as usize;
            if packet.len() < 5 + len + 2 {
                return None;
            }
            let name = String::from_utf8(packet[5..5 + len].to_vec()).ok()?;
            (name, 5 + len + 2)
        }
        ATYP_IPV6 => {
            if packet.len() < 22 {
                return None;
            }
            let addr: [u8; 16] = packet[4..20].try_into().ok()?;
            (format!("[{}]", Ipv6Addr::from(addr)), 22)
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([packet[header_len - 2], packet[header_len - 1]]);
    Some((header_len, format!("{host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aimbot::Direct;
    use crate::ingress::testing::{spawn_echo, spawn_locale};
    use tokio::net::TcpStream;

    async fn greet(client: &mut TcpStream) {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn connect_and_echo() {
        let echo = spawn_echo().await;
        let locale = spawn_locale(Arc::new(Direct)).await;
        let mut client = TcpStream::connect(locale).await.unwrap();
        greet(&mut client).await;

        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

        client.write_all(b"Hello World!").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello World!");
    }

    #[tokio::test]
    async fn bind_gets_an_error_reply() {
        let locale = spawn_locale(Arc::new(Direct)).await;
        let mut client = TcpStream::connect(locale).await.unwrap();
        greet(&mut client).await;

        let req = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn failed_connect_replies_before_closing() {
        let locale = spawn_locale(Arc::new(Direct)).await;
        let mut client = TcpStream::connect(locale).await.unwrap();
        greet(&mut client).await;

        let req = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 1];
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_GENERAL_FAILURE);
    }

    async fn spawn_udp_echo() -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn udp_associate_echo_round_trip() {
        let echo = spawn_udp_echo().await;
        let locale = spawn_locale(Arc::new(Direct)).await;
        let mut control = TcpStream::connect(locale).await.unwrap();
        greet(&mut control).await;

        let req = [0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        control.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        control.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        let bnd_port = u16::from_be_bytes([reply[8], reply[9]]);

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut packet = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1];
        packet.extend_from_slice(&echo.port().to_be_bytes());
        packet.extend_from_slice(b"P1P2P3");
        app.send_to(&packet, ("127.0.0.1", bnd_port)).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = app.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &packet[..]);
    }

    #[tokio::test]
    async fn fragmented_packets_are_dropped_and_the_session_continues() {
        let echo = spawn_udp_echo().await;
        let locale = spawn_locale(Arc::new(Direct)).await;
        let mut control = TcpStream::connect(locale).await.unwrap();
        greet(&mut control).await;

        let req = [0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        control.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        control.read_exact(&mut reply).await.unwrap();
        let bnd_port = u16::from_be_bytes([reply[8], reply[9]]);

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut fragged = vec![0x00, 0x00, 0x01, 0x01, 127, 0, 0, 1];
        fragged.extend_from_slice(&echo.port().to_be_bytes());
        fragged.extend_from_slice(b"dropped");
        app.send_to(&fragged, ("127.0.0.1", bnd_port)).await.unwrap();

        let mut packet = vec![0x00, 0x00, 0x00, 0x01, 127, 0, 0, 1];
        packet.extend_from_slice(&echo.port().to_be_bytes());
        packet.extend_from_slice(b"kept");
        app.send_to(&packet, ("127.0.0.1", bnd_port)).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = app.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &packet[..]);
    }

    #[test]
    fn udp_header_parsing() {
        let packet = [0, 0, 0, 1, 127, 0, 0, 1, 0, 7, 0xAA];
        let (len, dst) = parse_udp_header(&packet).unwrap();
        assert_eq!(len, 10);
        assert_eq!(dst, "127.0.0.1:7");

        let mut domain = vec![0, 0, 0, 3, 9];
        domain.extend_from_slice(b"localhost");
        domain.extend_from_slice(&53u16.to_be_bytes());
        let (len, dst) = parse_udp_header(&domain).unwrap();
        assert_eq!(len, domain.len());
        assert_eq!(dst, "localhost:53");

        // fragment flag set
        assert!(parse_udp_header(&[0, 0, 1, 1, 127, 0, 0, 1, 0, 7]).is_none());
        // truncated
        assert!(parse_udp_header(&[0, 0, 0]).is_none());
    }
}
