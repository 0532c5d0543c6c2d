//! SOCKS4 and SOCKS4a decoder. Only CONNECT is supported; the 0.0.0.x
//! address marker switches to the 4a trailing-hostname form.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

use crate::aimbot::{Dialer, Network};
use crate::context::Ctx;
use crate::error::{DazeError, Result};
use crate::stream::splice;

const CMD_CONNECT: u8 = 0x01;

const REPLY_GRANTED: [u8; 8] = [0x00, 0x5a, 0, 0, 0, 0, 0, 0];
const REPLY_REJECTED: [u8; 8] = [0x00, 0x5b, 0, 0, 0, 0, 0, 0];

pub async fn serve<D: Dialer>(
    dialer: &D,
    ctx: Ctx,
    client: &mut BufReader<TcpStream>,
) -> Result<()> {
    let _version = client.read_u8().await?;
    let command = client.read_u8().await?;
    let port = client.read_u16().await?;
    let mut addr = [0u8; 4];
    client.read_exact(&mut addr).await?;

    let mut user_id = Vec::new();
    client.read_until(0, &mut user_id).await?;

    let dst = if addr[0] == 0 && addr[1] == 0 && addr[2] == 0 && addr[3] != 0 {
        // SOCKS4a: the real hostname follows the user id.
        let mut host = Vec::new();
        client.read_until(0, &mut host).await?;
        host.pop();
        let host = String::from_utf8(host)
            .map_err(|_| DazeError::Decode("socks4a hostname is not ASCII".into()))?;
        format!("{host}:{port}")
    } else {
        format!("{}.{}.{}.{}:{}", addr[0], addr[1], addr[2], addr[3], port)
    };

    if command != CMD_CONNECT {
        client.write_all(&REPLY_REJECTED).await?;
        return Err(DazeError::Decode(format!(
            "socks4 command {command:#04x} unsupported"
        )));
    }

    info!(%ctx, dst, "socks4 connect");
    match dialer.dial(ctx, Network::Tcp, &dst).await {
        Ok(mut upstream) => {
            client.write_all(&REPLY_GRANTED).await?;
            client.flush().await?;
            splice(client, upstream.as_mut()).await?;
            Ok(())
        }
        Err(e) => {
            client.write_all(&REPLY_REJECTED).await?;
            Err(e)
        }
    }
}
