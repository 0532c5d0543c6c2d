use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Size of the cleartext random nonce opening every tunnel connection.
pub const NONCE_SIZE: usize = 128;

type Cipher = Ctr128BE<Aes256>;

/// The pre-shared 32-byte key: SHA-256 of the user password.
pub fn master_key(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

/// Per-connection cipher key, derived from the connection nonce and the
/// pre-shared key.
pub fn session_key(nonce: &[u8; NONCE_SIZE], key: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(key);
    hasher.finalize().into()
}

fn cipher(key: &[u8; 32]) -> Cipher {
    let iv = [0u8; 16];
    Cipher::new(key.into(), (&iv).into())
}

/// Duplex stream cipher wrapper. Two independent cipher states are
/// instantiated from the same derived key, one per direction, so reads
/// and writes keep separate keystream positions.
pub struct Gravity<T> {
    inner: T,
    rc: Cipher,
    wc: Cipher,
    pending: Vec<u8>,
    flushed: usize,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Gravity<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gravity")
            .field("inner", &self.inner)
            .field("pending", &self.pending)
            .field("flushed", &self.flushed)
            .finish()
    }
}

impl<T> Gravity<T> {
    pub fn new(inner: T, key: &[u8; 32]) -> Self {
        Self {
            inner,
            rc: cipher(key),
            wc: cipher(key),
            pending: Vec::new(),
            flushed: 0,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncWrite + Unpin> Gravity<T> {
    /// Push already-encrypted pending bytes into the inner stream.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.flushed < self.pending.len() {
            let n = std::task::ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.flushed..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.flushed += n;
        }
        self.pending.clear();
        self.flushed = 0;
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Gravity<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.rc.apply_keystream(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Gravity<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        this.pending.extend_from_slice(buf);
        this.wc.apply_keystream(&mut this.pending);
        // Best effort now; whatever stays pending drains on the next call.
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
