//! Byte-link adapter.
//!
//! Owns the TCP connection to the board and multiplexes it between the
//! interactive session and a transfer engine. A background fill task reads
//! the socket into an internal byte queue for the interactive consumer; while
//! transfer mode is active the fill task yields and the active engine reads
//! the socket directly through [`ByteLink::read_exact`]. The read half is
//! guarded by a lock, so the hand-off can never interleave queue fills with
//! engine reads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::time::{sleep, timeout, Instant};

use crate::{Result, RetroTermError};

/// Socket send/receive buffer size requested at connect time.
const SOCKET_BUFFER_SIZE: u32 = 64 * 1024;

/// How long one background read may block before re-checking transfer mode.
const FILL_POLL: Duration = Duration::from_millis(100);

/// Sleep slice of the paused fill task.
const FILL_PAUSE: Duration = Duration::from_millis(50);

/// Settle time after enabling transfer mode, at least one fill poll period so
/// the fill task is guaranteed to have seen the flag.
const TRANSFER_MODE_SETTLE: Duration = Duration::from_millis(120);

/// Largest chunk handed to the interactive consumer per `read_any` call.
const READ_BATCH: usize = 4096;

struct LinkShared {
    read: TokioMutex<OwnedReadHalf>,
    write: TokioMutex<OwnedWriteHalf>,
    queue: StdMutex<VecDeque<u8>>,
    queue_notify: Notify,
    transfer_mode: AtomicBool,
    connected: AtomicBool,
    running: AtomicBool,
}

/// Shared handle to one BBS connection.
#[derive(Clone)]
pub struct ByteLink {
    shared: Arc<LinkShared>,
}

impl ByteLink {
    /// Connect to a board.
    ///
    /// Disables Nagle, enables keepalive and enlarges the socket buffers,
    /// then starts the background fill task.
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| RetroTermError::Connection(format!("cannot resolve {host}:{port}")))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;

        let stream = timeout(connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| {
                RetroTermError::Connection(format!("timeout connecting to {host}:{port}"))
            })??;

        tracing::info!("connected to {}:{}", host, port);
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream (used by tests and by callers that
    /// manage their own dialing).
    pub fn from_stream(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", e);
        }
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(LinkShared {
            read: TokioMutex::new(read_half),
            write: TokioMutex::new(write_half),
            queue: StdMutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            transfer_mode: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            running: AtomicBool::new(true),
        });

        tokio::spawn(fill_loop(Arc::clone(&shared)));

        Self { shared }
    }

    /// Whether the peer is still connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Pause or resume the background fill task.
    ///
    /// Enabling waits long enough for the task to observe the flag, so the
    /// caller sees a clean socket afterwards.
    pub async fn set_transfer_mode(&self, active: bool) {
        self.shared.transfer_mode.store(active, Ordering::SeqCst);
        if active {
            sleep(TRANSFER_MODE_SETTLE).await;
        }
    }

    /// Whether bytes are waiting in the interactive queue.
    pub fn has_queued(&self) -> bool {
        !self.shared.queue.lock().unwrap().is_empty()
    }

    /// Discard everything in the interactive queue.
    pub fn clear_queue(&self) {
        self.shared.queue.lock().unwrap().clear();
    }

    /// Return whatever has already arrived, up to one batch.
    ///
    /// Waits up to `wait` for data; `None` means nothing arrived (which
    /// includes the peer having closed - check [`Self::is_connected`]).
    pub async fn read_any(&self, wait: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.shared.queue_notify.notified();
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if !queue.is_empty() {
                    let n = queue.len().min(READ_BATCH);
                    return Some(queue.drain(..n).collect());
                }
            }
            if !self.is_connected() {
                return None;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let _ = timeout(remaining, notified).await;
            if Instant::now() >= deadline {
                let mut queue = self.shared.queue.lock().unwrap();
                if queue.is_empty() {
                    return None;
                }
                let n = queue.len().min(READ_BATCH);
                return Some(queue.drain(..n).collect());
            }
        }
    }

    /// Blocking read of exactly `n` bytes, queue first, then the socket.
    ///
    /// Returns `None` on timeout; bytes collected before the timeout are put
    /// back at the front of the queue so nothing is lost across a retry.
    pub async fn read_exact(&self, n: usize, wait: Duration) -> Option<Vec<u8>> {
        let out = self.read_up_to(n, wait).await;
        if out.len() == n {
            return Some(out);
        }
        if !out.is_empty() {
            let mut queue = self.shared.queue.lock().unwrap();
            for &b in out.iter().rev() {
                queue.push_front(b);
            }
        }
        None
    }

    /// Like [`Self::read_exact`] but the caller opts into a partial result:
    /// whatever was collected by the deadline is returned, possibly short.
    pub async fn read_exact_or_partial(&self, n: usize, wait: Duration) -> Vec<u8> {
        self.read_up_to(n, wait).await
    }

    async fn read_up_to(&self, n: usize, wait: Duration) -> Vec<u8> {
        let deadline = Instant::now() + wait;
        let mut out = Vec::with_capacity(n);

        self.drain_queue_into(&mut out, n);
        if out.len() == n {
            return out;
        }

        // Holding the read lock keeps the fill task out of the socket for
        // the rest of this call.
        let mut half = self.shared.read.lock().await;
        // The fill task may have queued more bytes before we got the lock.
        self.drain_queue_into(&mut out, n);

        let mut buf = [0u8; 8192];
        while out.len() < n {
            if !self.is_connected() {
                break;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let want = (n - out.len()).min(buf.len());
            match timeout(remaining, half.read(&mut buf[..want])).await {
                Ok(Ok(0)) => {
                    self.mark_disconnected();
                    break;
                }
                Ok(Ok(k)) => out.extend_from_slice(&buf[..k]),
                Ok(Err(e)) => {
                    tracing::debug!("socket read error: {}", e);
                    self.mark_disconnected();
                    break;
                }
                Err(_) => break,
            }
        }
        out
    }

    fn drain_queue_into(&self, out: &mut Vec<u8>, n: usize) {
        let mut queue = self.shared.queue.lock().unwrap();
        while out.len() < n {
            match queue.pop_front() {
                Some(b) => out.push(b),
                None => break,
            }
        }
    }

    /// Send every byte or fail; a failed write permanently closes the link.
    pub async fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut half = self.shared.write.lock().await;
        let result = async {
            half.write_all(data).await?;
            half.flush().await
        }
        .await;
        if let Err(ref e) = result {
            tracing::warn!("socket write failed: {}", e);
            self.mark_disconnected();
        }
        result
    }

    /// Shut the connection down and stop the fill task.
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.mark_disconnected();
        let mut half = self.shared.write.lock().await;
        let _ = half.shutdown().await;
    }

    fn mark_disconnected(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.queue_notify.notify_waiters();
    }
}

/// Background fill task: socket -> interactive queue, paused in transfer mode.
async fn fill_loop(shared: Arc<LinkShared>) {
    let mut buf = [0u8; READ_BATCH];
    while shared.running.load(Ordering::SeqCst) && shared.connected.load(Ordering::SeqCst) {
        if shared.transfer_mode.load(Ordering::SeqCst) {
            sleep(FILL_PAUSE).await;
            continue;
        }

        let mut half = shared.read.lock().await;
        if shared.transfer_mode.load(Ordering::SeqCst) {
            continue;
        }
        match timeout(FILL_POLL, half.read(&mut buf)).await {
            Ok(Ok(0)) => {
                shared.connected.store(false, Ordering::SeqCst);
                shared.queue_notify.notify_waiters();
                break;
            }
            Ok(Ok(n)) => {
                {
                    let mut queue = shared.queue.lock().unwrap();
                    queue.extend(&buf[..n]);
                }
                shared.queue_notify.notify_waiters();
            }
            Ok(Err(e)) => {
                tracing::debug!("fill task read error: {}", e);
                shared.connected.store(false, Ordering::SeqCst);
                shared.queue_notify.notify_waiters();
                break;
            }
            Err(_) => {}
        }
    }
    tracing::debug!("fill task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (ByteLink, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (ByteLink::from_stream(client), server)
    }

    #[tokio::test]
    async fn test_read_any_receives_queued_bytes() {
        let (link, mut peer) = pair().await;
        peer.write_all(b"HELLO").await.unwrap();

        let data = link.read_any(Duration::from_secs(2)).await.unwrap();
        assert_eq!(data, b"HELLO");
    }

    #[tokio::test]
    async fn test_read_any_times_out() {
        let (link, _peer) = pair().await;
        let data = link.read_any(Duration::from_millis(100)).await;
        assert!(data.is_none());
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_read_exact_drains_queue_then_socket() {
        let (link, mut peer) = pair().await;
        peer.write_all(b"AB").await.unwrap();
        // Let the fill task queue the first chunk.
        sleep(Duration::from_millis(150)).await;
        assert!(link.has_queued());

        link.set_transfer_mode(true).await;
        peer.write_all(b"CD").await.unwrap();

        let data = link.read_exact(4, Duration::from_secs(2)).await.unwrap();
        assert_eq!(data, b"ABCD");
        link.set_transfer_mode(false).await;
    }

    #[tokio::test]
    async fn test_read_exact_timeout_preserves_partial() {
        let (link, mut peer) = pair().await;
        link.set_transfer_mode(true).await;
        peer.write_all(b"AB").await.unwrap();

        let missing = link.read_exact(4, Duration::from_millis(200)).await;
        assert!(missing.is_none());

        // The two collected bytes went back to the queue.
        let partial = link.read_exact_or_partial(4, Duration::from_millis(200)).await;
        assert_eq!(partial, b"AB");
    }

    #[tokio::test]
    async fn test_write_all_roundtrip() {
        let (link, mut peer) = pair().await;
        link.write_all(b"PING").await.unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
    }

    #[tokio::test]
    async fn test_peer_close_marks_disconnected() {
        let (link, peer) = pair().await;
        drop(peer);
        // read_any returns None once the fill task observes EOF.
        let _ = link.read_any(Duration::from_secs(2)).await;
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_clear_queue() {
        let (link, mut peer) = pair().await;
        peer.write_all(b"NOISE").await.unwrap();
        sleep(Duration::from_millis(150)).await;
        assert!(link.has_queued());
        link.clear_queue();
        assert!(!link.has_queued());
    }
}
