//! Single-client TCP frame server
//!
//! Accepts one client at a time, sends every frame it takes from the mailbox
//! as header + payload chunks, and goes back to accepting on disconnect.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::mailbox::FrameMailbox;
use super::protocol::{StreamFrame, FRAME_HEADER_LEN};
use crate::error::Result;
use crate::utils::bind_tcp_listener;

/// Largest single write of payload data
pub const CHUNK_SIZE: usize = 64 * 1024;

pub const DEFAULT_PORT: u16 = 8888;

/// One pending connection while a client is being served
const LISTEN_BACKLOG: i32 = 1;

/// Server counters
#[derive(Debug, Default)]
pub struct ServerStats {
    clients_served: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    disconnects: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub clients_served: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub disconnects: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            clients_served: self.clients_served.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Why a client session ended
#[derive(Debug)]
pub enum ClientExit {
    /// The peer closed its side
    PeerClosed,
    WriteFailed(io::Error),
    ReadFailed(io::Error),
    /// Server shutdown or mailbox closed
    Shutdown,
}

/// Write one frame: header, then the payload in [`CHUNK_SIZE`] pieces
pub async fn send_frame<W>(writer: &mut W, frame: &StreamFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.header().as_bytes()).await?;
    for chunk in frame.payload.chunks(CHUNK_SIZE) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

/// Serve one client until it disconnects or the server shuts down
///
/// Bytes sent by the client are read and ignored, which is how a closed
/// peer is noticed between frames.
pub async fn stream_to_client<R, W>(
    mut reader: R,
    mut writer: W,
    mailbox: &FrameMailbox<StreamFrame>,
    stats: &ServerStats,
    cancel: &CancellationToken,
) -> ClientExit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut discard = [0u8; 256];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ClientExit::Shutdown,
            frame = mailbox.consume() => {
                let Some(frame) = frame else {
                    return ClientExit::Shutdown;
                };
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return ClientExit::Shutdown,
                    sent = send_frame(&mut writer, &frame) => sent,
                };
                if let Err(e) = sent {
                    return ClientExit::WriteFailed(e);
                }
                stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes_sent
                    .fetch_add((FRAME_HEADER_LEN + frame.len()) as u64, Ordering::Relaxed);
            }
            read = reader.read(&mut discard) => match read {
                Ok(0) => return ClientExit::PeerClosed,
                Ok(n) => debug!("Ignoring {} bytes from client", n),
                Err(e) => return ClientExit::ReadFailed(e),
            },
        }
    }
}

/// TCP server streaming mailbox frames to one client at a time
pub struct StreamServer {
    listener: TcpListener,
    mailbox: Arc<FrameMailbox<StreamFrame>>,
    connected: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
}

impl StreamServer {
    /// Bind the listening socket. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, mailbox: Arc<FrameMailbox<StreamFrame>>) -> Result<Self> {
        let std_listener = bind_tcp_listener(addr, LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(std_listener)?;
        Ok(Self {
            listener,
            mailbox,
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ServerStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Set while a client is being served; read by the capture side
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub fn is_client_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Accept and serve clients until `cancel` fires
    ///
    /// The listening socket is closed when this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Streaming server listening on {}", addr);
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }
            info!("Client connected: {}", peer);
            self.stats.clients_served.fetch_add(1, Ordering::Relaxed);
            self.mailbox.clear();
            self.connected.store(true, Ordering::Release);

            let (reader, writer) = stream.into_split();
            let exit = stream_to_client(reader, writer, &self.mailbox, &self.stats, &cancel).await;

            if !matches!(exit, ClientExit::Shutdown) {
                self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
            }
            self.connected.store(false, Ordering::Release);
            self.mailbox.clear();

            match exit {
                ClientExit::Shutdown => {
                    info!("Closing client {} for shutdown", peer);
                    break;
                }
                ClientExit::PeerClosed => {
                    info!("Client {} disconnected", peer);
                }
                ClientExit::WriteFailed(e) | ClientExit::ReadFailed(e) => {
                    info!("Client {} disconnected: {}", peer, e);
                }
            }
        }

        info!("Streaming server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::protocol::{FrameHeader, FRAME_MAGIC};
    use crate::video::PixelFormat;
    use bytes::Bytes;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::duplex;
    use tokio::net::TcpStream;

    fn sample_frame(frame_id: u32, size: usize) -> StreamFrame {
        StreamFrame {
            payload: Bytes::from(vec![0xAB; size]),
            frame_id,
            width: 1920,
            height: 1080,
            pixel_format: PixelFormat::SBGGR10,
            timestamp_ns: 99,
        }
    }

    /// Accepts `remaining` bytes, then fails every write
    struct FailingWriter {
        remaining: usize,
        writes: usize,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            assert!(buf.len() <= CHUNK_SIZE);
            let n = buf.len().min(self.remaining);
            self.remaining -= n;
            self.writes += 1;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_send_frame_fails_mid_payload() {
        let mut writer = FailingWriter {
            remaining: FRAME_HEADER_LEN + CHUNK_SIZE + 100,
            writes: 0,
        };
        let err = send_frame(&mut writer, &sample_frame(1, 4 * CHUNK_SIZE))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(writer.writes, 3);
    }

    #[tokio::test]
    async fn test_stream_to_client_over_duplex() {
        let mailbox = FrameMailbox::new();
        let stats = ServerStats::default();
        let cancel = CancellationToken::new();

        let (client, server) = duplex(8 * CHUNK_SIZE);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, client_write) = tokio::io::split(client);

        mailbox.publish(sample_frame(7, 100_000));

        let serve = stream_to_client(server_read, server_write, &mailbox, &stats, &cancel);
        let read = async move {
            let mut header = [0u8; FRAME_HEADER_LEN];
            client_read.read_exact(&mut header).await.unwrap();
            let header = FrameHeader::decode(&header).unwrap();
            let mut payload = vec![0u8; header.payload_size as usize];
            client_read.read_exact(&mut payload).await.unwrap();
            drop(client_write);
            (header, payload)
        };

        let (exit, (header, payload)) = tokio::join!(serve, read);
        assert!(matches!(exit, ClientExit::PeerClosed));
        assert_eq!(header.frame_id, 7);
        assert_eq!((header.width, header.height), (1920, 1080));
        assert_eq!(payload.len(), 100_000);
        assert!(payload.iter().all(|b| *b == 0xAB));
        assert_eq!(stats.snapshot().frames_sent, 1);
        assert_eq!(
            stats.snapshot().bytes_sent,
            (FRAME_HEADER_LEN + 100_000) as u64
        );
    }

    #[tokio::test]
    async fn test_closed_mailbox_ends_client() {
        let mailbox = FrameMailbox::new();
        let stats = ServerStats::default();
        let cancel = CancellationToken::new();
        let (_client, server) = duplex(1024);
        let (r, w) = tokio::io::split(server);

        mailbox.close();
        let exit = stream_to_client(r, w, &mailbox, &stats, &cancel).await;
        assert!(matches!(exit, ClientExit::Shutdown));
    }

    async fn wait_connected(flag: &AtomicBool, expected: bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while flag.load(Ordering::Acquire) != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_client() {
        let mailbox = Arc::new(FrameMailbox::new());
        let server = StreamServer::bind("127.0.0.1:0".parse().unwrap(), mailbox.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server did not stop");
        result.unwrap().unwrap();
        assert_eq!(stats.snapshot().clients_served, 0);

        // The listening socket is gone
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_reaccept_after_disconnect_mid_payload() {
        let mailbox = Arc::new(FrameMailbox::new());
        let server = StreamServer::bind("127.0.0.1:0".parse().unwrap(), mailbox.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let connected = server.connected_flag();
        let stats = server.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        // First client reads only the header of a large frame and leaves
        let mut first = TcpStream::connect(addr).await.unwrap();
        wait_connected(&connected, true).await;
        mailbox.publish(sample_frame(1, 16 * 1024 * 1024));
        let mut header = [0u8; FRAME_HEADER_LEN];
        first.read_exact(&mut header).await.unwrap();
        assert_eq!(FrameHeader::decode(&header).unwrap().frame_id, 1);
        drop(first);

        wait_connected(&connected, false).await;
        assert_eq!(stats.snapshot().disconnects, 1);

        // The listener is still accepting
        let mut second = TcpStream::connect(addr).await.unwrap();
        wait_connected(&connected, true).await;
        mailbox.publish(sample_frame(2, 1000));
        let mut header = [0u8; FRAME_HEADER_LEN];
        second.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..4], &FRAME_MAGIC.to_ne_bytes());
        assert_eq!(FrameHeader::decode(&header).unwrap().frame_id, 2);

        cancel.cancel();
        mailbox.close();
        task.await.unwrap().unwrap();
        assert!(!connected.load(Ordering::Acquire));
        assert_eq!(stats.snapshot().clients_served, 2);
    }
}
