//! HTTP proxy decoder: plain forward-proxy requests, CONNECT tunnels and
//! websocket upgrades. One request, one upstream; plain forwards carry
//! `Connection: close` so the upstream's EOF delimits the response.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

use crate::aimbot::{Dialer, Network};
use crate::context::Ctx;
use crate::error::{DazeError, Result};
use crate::stream::splice;

const MAX_HEAD_BYTES: usize = 8192;

struct Request {
    method: String,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_websocket_upgrade(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
            && self
                .header("Upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    fn content_length(&self) -> u64 {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// The `host:port` this request targets. The port defaults to 80.
    fn address(&self) -> Result<String> {
        if self.method.eq_ignore_ascii_case("CONNECT") {
            return Ok(with_default_port(&self.uri));
        }
        if let Some(rest) = self.uri.strip_prefix("http://") {
            let authority = rest.split('/').next().unwrap_or(rest);
            return Ok(with_default_port(authority));
        }
        match self.header("Host") {
            Some(host) => Ok(with_default_port(host)),
            None => Err(DazeError::Decode(format!(
                "no destination in request for {:?}",
                self.uri
            ))),
        }
    }

    /// The request head rewritten for the origin server: origin-form
    /// path, hop-by-hop proxy headers dropped. `close` replaces any
    /// `Connection` header with `Connection: close`.
    fn upstream_head(&self, close: bool) -> Vec<u8> {
        let path = origin_form(&self.uri);
        let mut out = format!("{} {} {}\r\n", self.method, path, self.version);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Proxy-Connection") {
                continue;
            }
            if close && name.eq_ignore_ascii_case("Connection") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if close {
            out.push_str("Connection: close\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn with_default_port(authority: &str) -> String {
    // A colon after the last ']' (or anywhere, for non-IPv6) means an
    // explicit port is present.
    let host_end = authority.rfind(']').map(|i| i + 1).unwrap_or(0);
    if authority[host_end..].contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    }
}

fn origin_form(uri: &str) -> &str {
    if let Some(rest) = uri.strip_prefix("http://") {
        match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        }
    } else {
        uri
    }
}

async fn read_request(client: &mut BufReader<TcpStream>) -> Result<Option<Request>> {
    let mut line = String::new();
    if client.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m.to_string(), u.to_string(), v.to_string()),
        _ => {
            return Err(DazeError::Decode(format!(
                "malformed request line {:?}",
                line.trim_end()
            )))
        }
    };
    let mut headers = Vec::new();
    let mut total = line.len();
    loop {
        let mut line = String::new();
        if client.read_line(&mut line).await? == 0 {
            return Err(DazeError::Decode("request head truncated".into()));
        }
        total += line.len();
        if total > MAX_HEAD_BYTES {
            return Err(DazeError::Decode("request head too large".into()));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        match trimmed.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            None => {
                return Err(DazeError::Decode(format!("malformed header {trimmed:?}")))
            }
        }
    }
    Ok(Some(Request { method, uri, version, headers }))
}

pub async fn serve<D: Dialer>(
    dialer: &D,
    ctx: Ctx,
    client: &mut BufReader<TcpStream>,
) -> Result<()> {
    loop {
        let req = match read_request(client).await? {
            Some(req) => req,
            None => return Ok(()), // clean termination
        };
        let address = req.address()?;
        info!(%ctx, method = %req.method, address, "http request");

        if req.method.eq_ignore_ascii_case("CONNECT") {
            let mut upstream = dialer.dial(ctx, Network::Tcp, &address).await?;
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            client.flush().await?;
            splice(client, upstream.as_mut()).await?;
            return Ok(());
        }

        let mut upstream = dialer.dial(ctx, Network::Tcp, &address).await?;

        if req.is_websocket_upgrade() {
            upstream.write_all(&req.upstream_head(false)).await?;
            upstream.flush().await?;
            splice(client, upstream.as_mut()).await?;
            return Ok(());
        }

        upstream.write_all(&req.upstream_head(true)).await?;
        let body = req.content_length();
        if body > 0 {
            let mut limited = (&mut *client).take(body);
            tokio::io::copy(&mut limited, &mut upstream).await?;
        }
        upstream.flush().await?;
        tokio::io::copy(&mut upstream, client).await?;
        client.flush().await?;
    }
}
