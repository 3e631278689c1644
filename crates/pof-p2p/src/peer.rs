use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use pof_core::{Address, Identity, Role};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, Frame, Packet};
use crate::config::PeerConfig;
use crate::error::P2pError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Who sits at the other end of a connection
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub identity: Identity,
    pub role: Role,
    pub name: String,
}

impl PeerInfo {
    pub fn new(identity: Identity, role: Role) -> Self {
        PeerInfo {
            identity,
            role,
            name: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// One live connection to a remote formulator or observer.
///
/// Writes are serialized by the writer lock and bounded by the write
/// deadline. A keepalive task runs for the lifetime of the connection and
/// closes it once more than `keepalive_limit` pings go unanswered.
pub struct Peer {
    id: String,
    name: String,
    identity: Identity,
    role: Role,
    connected_at: u64,
    config: PeerConfig,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    ping_count: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Peer {
    /// Wrap both halves of an established connection and start its keepalive task
    pub fn spawn<R, W>(reader: R, writer: W, info: PeerInfo, config: PeerConfig) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = info.identity.address.to_hex();
        let name = if info.name.is_empty() {
            id.clone()
        } else {
            info.name
        };
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let (closed, _) = watch::channel(false);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);

        let peer = Arc::new(Peer {
            id,
            name,
            identity: info.identity,
            role: info.role,
            connected_at,
            config,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            ping_count: AtomicU64::new(0),
            closed,
        });

        info!(peer = %peer.name, role = %peer.role, "peer connected");
        tokio::spawn(Arc::clone(&peer).keepalive_loop());
        peer
    }

    pub fn from_tcp(stream: TcpStream, info: PeerInfo, config: PeerConfig) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let (reader, writer) = stream.into_split();
        Self::spawn(reader, writer, info, config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Unix seconds at which the connection was wrapped
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Keepalives sent since the remote side was last heard from
    pub fn missed_keepalives(&self) -> u64 {
        self.ping_count.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the peer is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the connection. Only the first call releases the stream halves.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Halves held by an in-flight read or write are dropped by that call
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        info!(peer = %self.name, "peer closed");
    }

    /// Queue-free, fire-and-forget send. A failed or late write closes the peer.
    pub async fn send(&self, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.write_raw(bytes).await {
            warn!(peer = %self.name, "send failed: {}", e);
            self.close();
        }
    }

    /// Block until the next non-keepalive frame arrives.
    ///
    /// Any read failure closes the peer; after that every call returns
    /// [`P2pError::Closed`].
    pub async fn receive(&self) -> Result<Frame, P2pError> {
        let mut guard = self.reader.lock().await;
        loop {
            let reader = guard.as_mut().ok_or(P2pError::Closed)?;
            let result = tokio::select! {
                _ = self.closed() => None,
                packet = codec::read_packet(reader, self.config.max_payload_len) => Some(packet),
            };

            match result {
                None => {
                    guard.take();
                    return Err(P2pError::Closed);
                }
                Some(Ok(Packet::Keepalive)) => {
                    self.ping_count.store(0, Ordering::Release);
                    trace!(peer = %self.name, "keepalive");
                }
                Some(Ok(Packet::Frame(frame))) => {
                    self.ping_count.store(0, Ordering::Release);
                    return Ok(frame);
                }
                Some(Err(e)) => {
                    guard.take();
                    drop(guard);
                    debug!(peer = %self.name, "read failed: {}", e);
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<(), P2pError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(P2pError::Closed)?;

        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        let result = match timeout(self.config.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(P2pError::Io(e)),
            Err(_) => Err(P2pError::WriteTimeout),
        };

        if result.is_err() || self.is_closed() {
            guard.take();
        }
        result
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let ping = codec::encode_keepalive();

        while !self.is_closed() {
            if let Err(e) = self.write_raw(&ping).await {
                debug!(peer = %self.name, "keepalive write failed: {}", e);
                break;
            }

            let missed = self.ping_count.fetch_add(1, Ordering::AcqRel) + 1;
            if missed > self.config.keepalive_limit {
                warn!(peer = %self.name, missed, "peer stopped answering keepalives");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.keepalive_interval) => {}
                _ = self.closed() => break,
            }
        }

        self.close();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pof_core::KeyPair;
    use std::time::Duration;
    use tokio::io::duplex;

    fn fast_config() -> PeerConfig {
        PeerConfig {
            write_timeout: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(50),
            keepalive_limit: 3,
            ..Default::default()
        }
    }

    fn info(role: Role) -> PeerInfo {
        PeerInfo::new(Identity::new(KeyPair::generate().public), role)
    }

    /// Two peers wired to each other over in-memory pipes
    fn connected_pair() -> (Arc<Peer>, Arc<Peer>) {
        let (a, b) = duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let left = Peer::spawn(a_read, a_write, info(Role::Formulator), fast_config());
        let right = Peer::spawn(b_read, b_write, info(Role::Observer), fast_config());
        (left, right)
    }

    #[tokio::test]
    async fn test_send_and_receive_frame() {
        let (left, right) = connected_pair();
        let bytes = codec::encode(7, b"proposal").unwrap();
        left.send(&bytes).await;

        let frame = right.receive().await.unwrap();
        assert_eq!(frame, Frame::new(7, b"proposal".to_vec()));
    }

    #[tokio::test]
    async fn test_name_defaults_to_id() {
        let (left, _right) = connected_pair();
        assert_eq!(left.name(), left.id());
        assert_eq!(left.id(), left.address().to_hex());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (left, _right) = connected_pair();
        left.close();
        left.close();
        assert!(left.is_closed());
        assert!(matches!(left.receive().await, Err(P2pError::Closed)));
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let (left, _right) = connected_pair();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let peer = Arc::clone(&left);
                tokio::spawn(async move { peer.close() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(left.is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let (left, _right) = connected_pair();
        let reader = Arc::clone(&left);
        let pending = tokio::spawn(async move { reader.receive().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        left.close();

        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(P2pError::Closed)));
    }

    #[tokio::test]
    async fn test_keepalives_keep_peers_alive() {
        let (left, right) = connected_pair();
        for peer in [&left, &right] {
            let peer = Arc::clone(peer);
            tokio::spawn(async move { while peer.receive().await.is_ok() {} });
        }

        // Well past the dead-peer window
        tokio::time::sleep(fast_config().dead_peer_window() * 3).await;
        assert!(!left.is_closed());
        assert!(!right.is_closed());
        assert!(left.missed_keepalives() <= fast_config().keepalive_limit);
    }

    #[tokio::test]
    async fn test_silent_remote_is_closed() {
        let (local, remote) = duplex(64 * 1024);
        let (read, write) = tokio::io::split(local);
        let peer = Peer::spawn(read, write, info(Role::Observer), fast_config());
        let drain = tokio::spawn(async move {
            while peer.receive().await.is_ok() {}
            peer
        });

        // Remote end stays open but never writes
        let _remote = remote;
        let peer = timeout(Duration::from_secs(2), drain).await.unwrap().unwrap();
        assert!(peer.is_closed());
        assert!(peer.missed_keepalives() > fast_config().keepalive_limit);
    }

    #[tokio::test]
    async fn test_send_after_remote_drop_closes_peer() {
        let (local, remote) = duplex(1024);
        let (read, write) = tokio::io::split(local);
        let peer = Peer::spawn(read, write, info(Role::Formulator), fast_config());
        drop(remote);

        peer.send(&codec::encode(1, b"late").unwrap()).await;
        timeout(Duration::from_secs(1), peer.closed()).await.unwrap();
        assert!(peer.is_closed());
    }
}
