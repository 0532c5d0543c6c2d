//! The stream multiplexer: many logical streams over one reliable
//! transport, framed with a four-byte header, with priority-aware writes
//! and half-close semantics. The engine module runs the tunnel protocol
//! on top of it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::czar::pool::IdPool;
use crate::error::{DazeError, Result};
use crate::stream::BoxedIo;
use crate::sync::{Latch, Priority};

mod engine;
mod pool;

pub use engine::{Client, Server};

/// Largest data frame payload: the four-byte header plus payload must
/// fit a 2048-byte buffer.
pub const MAX_DATA_LEN: usize = 2044;

const CMD_OPEN: u8 = 0x00;
const CMD_DATA: u8 = 0x01;
const CMD_CLOSE: u8 = 0x02;

const CLOSE_ACTIVE: u8 = 0x00;
const CLOSE_PASSIVE: u8 = 0x01;

/// Write priorities: control frames overtake queued data frames.
const PRI_CONTROL: usize = 0;
const PRI_DATA: usize = 1;
const PRI_LEVELS: usize = 3; // the third level is reserved

const READ_CHANNEL_DEPTH: usize = 32;
const ACCEPT_CHANNEL_DEPTH: usize = 32;

fn closed_pipe() -> io::Error {
    DazeError::ClosedPipe.into()
}

fn protocol_violation(msg: &'static str) -> io::Error {
    DazeError::MuxProtocol(msg).into()
}

/// State a routed slot shares with the mux read task. A `None` slot is
/// the wither: a fully closed placeholder that accepts a fresh open.
struct Slot {
    tx: mpsc::Sender<Bytes>,
    wer: Arc<Latch>,
    once: Arc<AtomicBool>,
}

struct Shared {
    writer: Priority<WriteHalf<BoxedIo>>,
    pool: Mutex<IdPool>,
    slots: Mutex<Vec<Option<Slot>>>,
    err: Latch,
    closer_tx: mpsc::UnboundedSender<(u8, u8)>,
}

impl Shared {
    async fn write_frame(&self, pri: usize, head: [u8; 4], payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock(pri).await;
        writer.write_all(&head).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        writer.flush().await
    }
}

/// One multiplexer over one transport, managing up to 256 streams.
pub struct Mux {
    shared: Arc<Shared>,
}

impl Mux {
    /// Split the transport and start the frame-read and close-writer
    /// tasks. The returned receiver yields peer-opened streams.
    pub fn new(transport: BoxedIo) -> (Self, mpsc::Receiver<Stream>) {
        let (read_half, write_half) = tokio::io::split(transport);
        let (closer_tx, closer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            writer: Priority::new(PRI_LEVELS, write_half),
            pool: Mutex::new(IdPool::new()),
            slots: Mutex::new((0..=u8::MAX).map(|_| None).collect()),
            err: Latch::new(),
            closer_tx,
        });
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CHANNEL_DEPTH);
        tokio::spawn(read_loop(shared.clone(), read_half, accept_tx));
        tokio::spawn(close_loop(shared.clone(), closer_rx));
        (Self { shared }, accept_rx)
    }

    /// The transport error, once the mux has torn down.
    pub fn error(&self) -> Option<io::Error> {
        self.shared.err.get()
    }

    /// Open a stream with the lowest free id. Exhaustion is a soft
    /// error; a dead mux returns its transport error.
    pub async fn open(&self) -> Result<Stream> {
        if let Some(err) = self.shared.err.get() {
            return Err(DazeError::Io(err));
        }
        let id = match self.shared.pool.lock().get() {
            Some(id) => id,
            None => return Err(DazeError::PoolExhausted),
        };
        let (stream, slot) = Stream::pair(id, &self.shared);
        self.shared.slots.lock()[id as usize] = Some(slot);
        if let Err(e) = self
            .shared
            .write_frame(PRI_CONTROL, [id, CMD_OPEN, 0, 0], &[])
            .await
        {
            self.shared.slots.lock()[id as usize] = None;
            stream.once.store(true, Ordering::SeqCst);
            self.shared.pool.lock().put(id);
            return Err(DazeError::Io(e));
        }
        Ok(stream)
    }
}

/// One logical byte pipe inside a mux.
pub struct Stream {
    id: u8,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    off: usize,
    rer: Arc<Latch>,
    wer: Arc<Latch>,
    once: Arc<AtomicBool>,
    write_fut: Option<Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("leftover", &self.leftover)
            .field("off", &self.off)
            .finish()
    }
}

impl Stream {
    fn pair(id: u8, shared: &Arc<Shared>) -> (Stream, Slot) {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_DEPTH);
        let wer = Arc::new(Latch::new());
        let once = Arc::new(AtomicBool::new(false));
        let stream = Stream {
            id,
            shared: shared.clone(),
            rx,
            leftover: Bytes::new(),
            off: 0,
            rer: Arc::new(Latch::new()),
            wer: wer.clone(),
            once: once.clone(),
            write_fut: None,
        };
        (stream, Slot { tx, wer, once })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Active close: latch both directions, retire the slot and hand the
    /// close frame plus the id return to the close-writer task. The once
    /// flag keeps every path idempotent.
    fn close_now(&self) {
        self.rer.put(closed_pipe());
        self.wer.put(closed_pipe());
        if self.once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.slots.lock()[self.id as usize] = None;
        let _ = self.shared.closer_tx.send((self.id, CLOSE_ACTIVE));
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close_now();
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.rer.get() {
            return Poll::Ready(Err(err));
        }
        if this.off < this.leftover.len() {
            let n = buf.remaining().min(this.leftover.len() - this.off);
            buf.put_slice(&this.leftover[this.off..this.off + n]);
            this.off += n;
            if this.off == this.leftover.len() {
                this.leftover = Bytes::new();
                this.off = 0;
            }
            return Poll::Ready(Ok(()));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let n = buf.remaining().min(chunk.len());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    this.leftover = chunk;
                    this.off = n;
                }
                Poll::Ready(Ok(()))
            }
            // The channel closes on passive close (EOF) and on mux
            // teardown (the latched transport error).
            Poll::Ready(None) => match this.shared.err.get() {
                Some(err) => Poll::Ready(Err(err)),
                None => Poll::Ready(Ok(())),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.write_fut.as_mut() {
                let res = std::task::ready!(fut.as_mut().poll(cx));
                this.write_fut = None;
                return Poll::Ready(res);
            }
            if let Some(err) = this.wer.get() {
                return Poll::Ready(Err(err));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let n = buf.len().min(MAX_DATA_LEN);
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            let shared = this.shared.clone();
            let wer = this.wer.clone();
            let id = this.id;
            this.write_fut = Some(Box::pin(async move {
                if let Some(err) = wer.get() {
                    return Err(err);
                }
                let head = [id, CMD_DATA, (n >> 8) as u8, n as u8];
                match shared.write_frame(PRI_DATA, head, &chunk).await {
                    Ok(()) => Ok(n),
                    Err(e) => {
                        wer.put(io::Error::new(e.kind(), e.to_string()));
                        Err(e)
                    }
                }
            }));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed to the transport as they are written.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close_now();
        Poll::Ready(Ok(()))
    }
}

/// Per-mux frame reader: routes data frames, reacts to opens and closes,
/// and on any transport error or protocol violation tears the whole mux
/// down, failing every stream.
async fn read_loop(
    shared: Arc<Shared>,
    mut transport: ReadHalf<BoxedIo>,
    accept_tx: mpsc::Sender<Stream>,
) {
    let err = loop {
        let mut head = [0u8; 4];
        if let Err(e) = transport.read_exact(&mut head).await {
            break e;
        }
        let (id, cmd) = (head[0], head[1]);
        let len = u16::from_be_bytes([head[2], head[3]]) as usize;
        match cmd {
            CMD_OPEN => {
                let stream = {
                    let mut slots = shared.slots.lock();
                    if slots[id as usize].is_some() {
                        break protocol_violation("open of a still-open stream id");
                    }
                    shared.pool.lock().set(id);
                    let (stream, slot) = Stream::pair(id, &shared);
                    slots[id as usize] = Some(slot);
                    stream
                };
                if accept_tx.send(stream).await.is_err() {
                    // No acceptor; the dropped stream closes itself.
                    debug!(id, "incoming stream dropped");
                }
            }
            CMD_DATA => {
                if len == 0 || len > MAX_DATA_LEN {
                    break protocol_violation("data frame length out of range");
                }
                let mut payload = vec![0u8; len];
                if let Err(e) = transport.read_exact(&mut payload).await {
                    break e;
                }
                let payload = Bytes::from(payload);
                let tx = shared.slots.lock()[id as usize]
                    .as_ref()
                    .map(|slot| slot.tx.clone());
                match tx {
                    Some(tx) => {
                        let _ = tx.send(payload).await;
                    }
                    None => debug!(id, "data for a closed stream discarded"),
                }
            }
            CMD_CLOSE => {
                let slot = shared.slots.lock()[id as usize].take();
                if let Some(slot) = slot {
                    slot.wer.put(closed_pipe());
                    if !slot.once.swap(true, Ordering::SeqCst) {
                        let _ = shared.closer_tx.send((id, CLOSE_PASSIVE));
                    }
                    // Dropping the slot ends the stream's read channel;
                    // readers drain what was delivered, then see EOF.
                }
            }
            _ => break protocol_violation("unknown command"),
        }
    };
    warn!(error = %err, "mux transport down");
    shared.err.put(err);
    let mut slots = shared.slots.lock();
    for entry in slots.iter_mut() {
        if let Some(slot) = entry.take() {
            if let Some(err) = shared.err.get() {
                slot.wer.put(err);
            }
        }
    }
}

/// Close-frame writer: serializes 0x02 emission at high priority and
/// returns each id to the pool only after its close frame is on the
/// wire, so a recycled id can never overtake its own close.
async fn close_loop(shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<(u8, u8)>) {
    loop {
        tokio::select! {
            req = requests.recv() => match req {
                Some((id, flag)) => {
                    let _ = shared
                        .write_frame(PRI_CONTROL, [id, CMD_CLOSE, flag, 0], &[])
                        .await;
                    shared.pool.lock().put(id);
                }
                None => break,
            },
            _ = shared.err.wait() => {
                while let Ok((id, _)) = requests.try_recv() {
                    shared.pool.lock().put(id);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::sleep;

    fn mux_over_duplex(buffer: usize) -> (Mux, mpsc::Receiver<Stream>, tokio::io::DuplexStream) {
        let (near, far) = duplex(buffer);
        let (mux, accept) = Mux::new(Box::new(near));
        (mux, accept, far)
    }

    fn mux_pair() -> (Mux, mpsc::Receiver<Stream>, Mux, mpsc::Receiver<Stream>) {
        let (a, b) = duplex(64 * 1024);
        let (left, left_accept) = Mux::new(Box::new(a));
        let (right, right_accept) = Mux::new(Box::new(b));
        (left, left_accept, right, right_accept)
    }

    #[tokio::test]
    async fn open_write_close_wire_format() {
        let (mux, _accept, mut far) = mux_over_duplex(4096);
        let mut stream = mux.open().await.unwrap();
        assert_eq!(stream.id(), 0);
        stream.write_all(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut wire = [0u8; 16];
        far.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..4], &[0x00, 0x00, 0x00, 0x00]); // open
        assert_eq!(&wire[4..8], &[0x00, 0x01, 0x00, 0x04]); // data, len 4
        assert_eq!(&wire[8..12], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&wire[12..16], &[0x00, 0x02, 0x00, 0x00]); // active close

        // The id is recycled once the close frame is out.
        sleep(Duration::from_millis(20)).await;
        let stream = mux.open().await.unwrap();
        assert_eq!(stream.id(), 0);
    }

    #[tokio::test]
    async fn data_round_trips_between_two_muxes() {
        let (left, _la, _right, mut right_accept) = mux_pair();
        let mut out = left.open().await.unwrap();
        let mut inbound = right_accept.recv().await.unwrap();

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            out.write_all(&payload).await.unwrap();
            out.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        inbound.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn writes_are_chunked_to_the_frame_limit() {
        let (mux, _accept, mut far) = mux_over_duplex(256 * 1024);
        let mut stream = mux.open().await.unwrap();
        let payload = vec![7u8; MAX_DATA_LEN + 100];
        stream.write_all(&payload).await.unwrap();

        let mut head = [0u8; 4];
        far.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, &[0x00, 0x00, 0x00, 0x00]);
        far.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], CMD_DATA);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]) as usize, MAX_DATA_LEN);
        let mut first = vec![0u8; MAX_DATA_LEN];
        far.read_exact(&mut first).await.unwrap();
        far.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], CMD_DATA);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), 100);
    }

    #[tokio::test]
    async fn closed_stream_rejects_io_idempotently() {
        let (left, _la, _right, mut right_accept) = mux_pair();
        let mut stream = left.open().await.unwrap();
        let _peer = right_accept.recv().await.unwrap();
        stream.shutdown().await.unwrap();

        for _ in 0..2 {
            let err = stream.write_all(b"x").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
            let mut buf = [0u8; 4];
            let err = stream.read(&mut buf).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        }
    }

    #[tokio::test]
    async fn passive_close_is_eof_after_draining() {
        let (left, _la, _right, mut right_accept) = mux_pair();
        let mut out = left.open().await.unwrap();
        let mut inbound = right_accept.recv().await.unwrap();

        out.write_all(b"tail").await.unwrap();
        out.shutdown().await.unwrap();

        // The peer still reads the data delivered before the close.
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tail");
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 0);

        // Writes on the passively closed stream fail.
        sleep(Duration::from_millis(20)).await;
        assert!(inbound.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn reopening_a_recycled_id_is_accepted() {
        let (left, _la, _right, mut right_accept) = mux_pair();
        let first = left.open().await.unwrap();
        assert_eq!(first.id(), 0);
        let peer = right_accept.recv().await.unwrap();
        drop(first);
        drop(peer);

        // Wait for the close to round-trip, then open id 0 again.
        sleep(Duration::from_millis(50)).await;
        let second = left.open().await.unwrap();
        assert_eq!(second.id(), 0);
        let peer = right_accept.recv().await.unwrap();
        assert_eq!(peer.id(), 0);
    }

    #[tokio::test]
    async fn pool_exhaustion_is_a_soft_error() {
        let (mux, _accept, far) = mux_over_duplex(64 * 1024);
        let mut streams = Vec::new();
        for expect in 0..=255u8 {
            let stream = mux.open().await.unwrap();
            assert_eq!(stream.id(), expect);
            streams.push(stream);
        }
        let err = mux.open().await.unwrap_err();
        assert!(matches!(err, DazeError::PoolExhausted));

        drop(streams.remove(3));
        // The id comes back once the close frame has been written.
        let mut reopened = None;
        for _ in 0..100 {
            match mux.open().await {
                Ok(stream) => {
                    reopened = Some(stream);
                    break;
                }
                Err(DazeError::PoolExhausted) => sleep(Duration::from_millis(5)).await,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(reopened.expect("id 3 should come back").id(), 3);
        drop(far);
    }

    #[tokio::test]
    async fn unknown_command_tears_the_mux_down() {
        let (mux, _accept, mut far) = mux_over_duplex(4096);
        let mut stream = mux.open().await.unwrap();
        let mut head = [0u8; 4];
        far.read_exact(&mut head).await.unwrap(); // consume the open

        far.write_all(&[0x00, 0x77, 0x00, 0x00]).await.unwrap();
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(mux.error().is_some());
        assert!(mux.open().await.is_err());
    }

    #[tokio::test]
    async fn transport_eof_fails_all_streams() {
        let (mux, _accept, far) = mux_over_duplex(4096);
        let mut a = mux.open().await.unwrap();
        let mut b = mux.open().await.unwrap();
        drop(far);

        let mut buf = [0u8; 4];
        assert!(a.read(&mut buf).await.is_err());
        assert!(b.read(&mut buf).await.is_err());
        assert!(mux.open().await.is_err());
    }

    #[tokio::test]
    async fn open_on_a_still_open_id_is_a_violation() {
        let (mux, mut accept, mut far) = mux_over_duplex(4096);
        far.write_all(&[0x05, CMD_OPEN, 0, 0]).await.unwrap();
        let first = accept.recv().await.unwrap();
        assert_eq!(first.id(), 5);

        far.write_all(&[0x05, CMD_OPEN, 0, 0]).await.unwrap();
        // The second open on a live id kills the whole mux.
        for _ in 0..100 {
            if mux.error().is_some() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(mux.error().is_some());
    }
}
