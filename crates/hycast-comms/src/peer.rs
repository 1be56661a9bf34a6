//! A peer session: one bidirectional connection exchanging notices,
//! requests, and chunk data over six fixed logical streams.
//!
//! A session starts with a version exchange on stream 0. After that an
//! internal receiver task dispatches every incoming record to the
//! session's [`PeerMsgRcvr`], while any number of caller tasks invoke the
//! send operations. The header read is the only cancellation point: once
//! a record header has been read, its body is consumed whole.
//!
//! Every session is unique. Two peers never compare equal, even when
//! they connect the same pair of addresses.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use zerocopy::{AsBytes, FromBytes};

use hycast_core::codec::PROTOCOL_VERSION;
use hycast_core::wire::{StreamId, VersionRecord};
use hycast_core::{ActualChunk, ChunkInfo, Error, LatentChunk, ProdIndex, ProdInfo, Result};

use crate::channel::{Channel, ChunkChannel};
use crate::sock::{RecordReader, RecordSock, RecordWriter};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

// ── Message receiver ─────────────────────────────────────────────────────────

/// What a session's owner does with incoming messages. Each callback
/// receives the originating peer so it can answer on the same session.
#[async_trait]
pub trait PeerMsgRcvr: Send + Sync {
    async fn recv_prod_notice(&self, info: ProdInfo, peer: &Peer);

    async fn recv_chunk_notice(&self, info: ChunkInfo, peer: &Peer);

    async fn recv_prod_request(&self, index: ProdIndex, peer: &Peer);

    async fn recv_chunk_request(&self, info: ChunkInfo, peer: &Peer);

    /// Must drain or discard the chunk before returning; the receiver
    /// loop fails the session otherwise.
    async fn recv_data(&self, chunk: &mut LatentChunk, peer: &Peer);
}

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Created = 0,
    Handshaking = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerState::Created,
            1 => PeerState::Handshaking,
            2 => PeerState::Running,
            3 => PeerState::Closing,
            _ => PeerState::Closed,
        }
    }
}

// ── Channels ─────────────────────────────────────────────────────────────────

/// The six typed stream views of one session.
#[derive(Clone, Copy)]
struct Channels {
    prod_notice: Channel<ProdInfo>,
    chunk_notice: Channel<ChunkInfo>,
    prod_req: Channel<ProdIndex>,
    chunk_req: Channel<ChunkInfo>,
    chunk: ChunkChannel,
}

impl Channels {
    fn new(version: u32) -> Self {
        Channels {
            prod_notice: Channel::new(StreamId::ProdNotice, version),
            chunk_notice: Channel::new(StreamId::ChunkNotice, version),
            prod_req: Channel::new(StreamId::ProdReq, version),
            chunk_req: Channel::new(StreamId::ChunkReq, version),
            chunk: ChunkChannel::new(StreamId::Chunk, version),
        }
    }
}

// ── Peer ─────────────────────────────────────────────────────────────────────

struct PeerShared {
    id: u64,
    version: u32,
    writer: RecordWriter,
    remote: Option<SocketAddr>,
    channels: Channels,
    state: AtomicU8,
    shutdown: Arc<Notify>,
    receiver: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl PeerShared {
    fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn get_state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl Drop for PeerShared {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.get_mut().take() {
            handle.abort();
        }
    }
}

/// A handle on one peer session. Cheap to clone; clones alias the same
/// session.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Starts a session on an established connection: exchanges protocol
    /// versions, then spawns the receiver task. A remote peer with a
    /// different version fails the session with a logic error.
    pub async fn start(sock: RecordSock, msg_rcvr: Arc<dyn PeerMsgRcvr>) -> Result<Peer> {
        let (mut reader, writer, remote) = sock.split();
        let id = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(PeerShared {
            id,
            version: PROTOCOL_VERSION,
            writer,
            remote,
            channels: Channels::new(PROTOCOL_VERSION),
            state: AtomicU8::new(PeerState::Created as u8),
            shutdown: Arc::new(Notify::new()),
            receiver: Mutex::new(None),
        });
        let peer = Peer {
            shared: shared.clone(),
        };

        shared.set_state(PeerState::Handshaking);
        let remote_version = handshake(&mut reader, &shared.writer, shared.version).await?;
        if remote_version != shared.version {
            shared.set_state(PeerState::Closed);
            return Err(Error::logic(format!(
                "remote peer uses unsupported protocol version: {remote_version}"
            )));
        }
        shared.set_state(PeerState::Running);
        tracing::debug!(peer = id, version = shared.version, "peer session running");

        let handle = tokio::spawn(run_receiver(
            reader,
            Arc::downgrade(&shared),
            shared.shutdown.clone(),
            shared.channels,
            msg_rcvr,
        ));
        *shared.receiver.lock() = Some(handle);
        Ok(peer)
    }

    /// Process-unique session identity.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> PeerState {
        self.shared.get_state()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            PeerState::Running => Ok(()),
            state => Err(Error::logic(format!("peer is {state:?}"))),
        }
    }

    /// Advertises a product to the remote peer.
    pub async fn send_prod_notice(&self, info: &ProdInfo) -> Result<()> {
        self.ensure_running()?;
        self.shared
            .channels
            .prod_notice
            .send(&self.shared.writer, info)
            .await
    }

    /// Advertises a chunk of data to the remote peer.
    pub async fn send_chunk_notice(&self, info: &ChunkInfo) -> Result<()> {
        self.ensure_running()?;
        self.shared
            .channels
            .chunk_notice
            .send(&self.shared.writer, info)
            .await
    }

    /// Requests product information from the remote peer.
    pub async fn send_prod_request(&self, index: ProdIndex) -> Result<()> {
        self.ensure_running()?;
        self.shared
            .channels
            .prod_req
            .send(&self.shared.writer, &index)
            .await
    }

    /// Requests a chunk of data from the remote peer.
    pub async fn send_chunk_request(&self, info: &ChunkInfo) -> Result<()> {
        self.ensure_running()?;
        self.shared
            .channels
            .chunk_req
            .send(&self.shared.writer, info)
            .await
    }

    /// Sends a chunk of data to the remote peer.
    pub async fn send_data(&self, chunk: &ActualChunk) -> Result<()> {
        self.ensure_running()?;
        self.shared
            .channels
            .chunk
            .send(&self.shared.writer, chunk)
            .await
    }

    /// Stops the receiver task at its next cancellation point and joins
    /// it, surfacing any session error it was holding.
    pub async fn close(&self) -> Result<()> {
        self.shared.set_state(PeerState::Closing);
        self.shared.shutdown.notify_one();
        let handle = self.shared.receiver.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(result) => result?,
                Err(err) if err.is_cancelled() => {}
                Err(err) => return Err(Error::logic(format!("receiver task panicked: {err}"))),
            }
        }
        self.shared.set_state(PeerState::Closed);
        Ok(())
    }

    /// Waits for the receiver to stop on its own (remote close or
    /// session error).
    pub async fn join(&self) -> Result<()> {
        let handle = self.shared.receiver.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(Error::logic(format!("receiver task panicked: {err}"))),
            },
            None => Ok(()),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl PartialOrd for Peer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Peer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.shared.id.cmp(&other.shared.id)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer{{id={}, version={}", self.shared.id, self.shared.version)?;
        if let Some(remote) = self.shared.remote {
            write!(f, ", remote={remote}")?;
        }
        write!(f, "}}")
    }
}

// ── Handshake & receiver loop ────────────────────────────────────────────────

async fn handshake(
    reader: &mut RecordReader,
    writer: &RecordWriter,
    version: u32,
) -> Result<u32> {
    writer
        .send(
            StreamId::Version.into(),
            VersionRecord::new(version).as_bytes(),
        )
        .await?;

    let Some((stream_id, len)) = reader.next_record().await? else {
        return Err(Error::runtime("peer closed during version exchange"));
    };
    if stream_id != u16::from(StreamId::Version) {
        return Err(Error::logic("first message is not a version message"));
    }
    let body = reader.read_body(len).await?;
    let record = VersionRecord::read_from(&body[..])
        .ok_or_else(|| Error::runtime("malformed version message"))?;
    Ok(record.version.get())
}

async fn run_receiver(
    mut reader: RecordReader,
    weak: Weak<PeerShared>,
    shutdown: Arc<Notify>,
    channels: Channels,
    msg_rcvr: Arc<dyn PeerMsgRcvr>,
) -> Result<()> {
    let result = receive_loop(&mut reader, &weak, &shutdown, &channels, msg_rcvr.as_ref()).await;
    if let Some(shared) = weak.upgrade() {
        shared.set_state(PeerState::Closed);
        match &result {
            Ok(()) => tracing::debug!(peer = shared.id, "peer receiver stopped"),
            Err(err) => tracing::warn!(peer = shared.id, error = %err, "peer receiver failed"),
        }
    }
    result
}

async fn receive_loop(
    reader: &mut RecordReader,
    weak: &Weak<PeerShared>,
    shutdown: &Notify,
    channels: &Channels,
    msg_rcvr: &dyn PeerMsgRcvr,
) -> Result<()> {
    loop {
        // The header read is the only cancellation point. A zero-length
        // read means the remote peer closed cleanly.
        let header = tokio::select! {
            _ = shutdown.notified() => return Ok(()),
            header = reader.next_record() => header?,
        };
        let Some((stream_id, len)) = header else {
            return Ok(());
        };
        let body = reader.read_body(len).await?;

        let Some(shared) = weak.upgrade() else {
            return Ok(());
        };
        let peer = Peer { shared };
        match StreamId::from_u16(stream_id) {
            Some(StreamId::ProdNotice) => {
                let info = channels.prod_notice.decode(body)?;
                msg_rcvr.recv_prod_notice(info, &peer).await;
            }
            Some(StreamId::ChunkNotice) => {
                let info = channels.chunk_notice.decode(body)?;
                msg_rcvr.recv_chunk_notice(info, &peer).await;
            }
            Some(StreamId::ProdReq) => {
                let index = channels.prod_req.decode(body)?;
                msg_rcvr.recv_prod_request(index, &peer).await;
            }
            Some(StreamId::ChunkReq) => {
                let info = channels.chunk_req.decode(body)?;
                msg_rcvr.recv_chunk_request(info, &peer).await;
            }
            Some(StreamId::Chunk) => {
                let mut chunk = channels.chunk.decode(body)?;
                msg_rcvr.recv_data(&mut chunk, &peer).await;
                if chunk.has_data() {
                    return Err(Error::logic("latent chunk still has data after dispatch"));
                }
            }
            Some(StreamId::Version) | None => {
                tracing::trace!(stream_id, "discarding record on unexpected stream");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRcvr;

    #[async_trait]
    impl PeerMsgRcvr for NullRcvr {
        async fn recv_prod_notice(&self, _info: ProdInfo, _peer: &Peer) {}
        async fn recv_chunk_notice(&self, _info: ChunkInfo, _peer: &Peer) {}
        async fn recv_prod_request(&self, _index: ProdIndex, _peer: &Peer) {}
        async fn recv_chunk_request(&self, _info: ChunkInfo, _peer: &Peer) {}
        async fn recv_data(&self, chunk: &mut LatentChunk, _peer: &Peer) {
            chunk.discard();
        }
    }

    async fn start_pair() -> (Peer, Peer) {
        let (a, b) = RecordSock::pair();
        let (a, b) = tokio::join!(
            Peer::start(a, Arc::new(NullRcvr)),
            Peer::start(b, Arc::new(NullRcvr)),
        );
        (a.unwrap(), b.unwrap())
    }

    #[tokio::test]
    async fn sessions_handshake_and_run() {
        let (a, b) = start_pair().await;
        assert_eq!(a.state(), PeerState::Running);
        assert_eq!(b.state(), PeerState::Running);
        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(a.state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn version_mismatch_fails_the_session() {
        let (a, b) = RecordSock::pair();
        let (_, writer, _) = a.split();
        tokio::spawn(async move {
            writer
                .send(
                    StreamId::Version.into(),
                    VersionRecord::new(99).as_bytes(),
                )
                .await
                .unwrap();
        });

        let err = Peer::start(b, Arc::new(NullRcvr)).await.unwrap_err();
        assert!(matches!(err, Error::Logic(_)), "got {err}");
    }

    #[tokio::test]
    async fn every_session_is_unique() {
        let (a1, b1) = start_pair().await;
        let (a2, b2) = start_pair().await;
        assert_ne!(a1, a2);
        assert_ne!(a1, b1);
        assert_eq!(a1, a1.clone());
        let mut ids = [a1.id(), b1.id(), a2.id(), b2.id()];
        ids.sort_unstable();
        ids.windows(2).for_each(|w| assert_ne!(w[0], w[1]));
        for peer in [a1, b1, a2, b2] {
            peer.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn sends_after_close_report_closed() {
        let (a, b) = start_pair().await;
        a.close().await.unwrap();
        let info = ProdInfo::new("p", ProdIndex::new(1), 1_000, 1_000).unwrap();
        let err = a.send_prod_notice(&info).await.unwrap_err();
        assert!(matches!(err, Error::Logic(_)), "got {err}");
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn remote_close_stops_the_receiver_cleanly() {
        let (a, b) = start_pair().await;
        drop(a);
        b.join().await.unwrap();
        assert_eq!(b.state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn unknown_streams_are_discarded() {
        let (a, b) = RecordSock::pair();
        let (_, writer, _) = a.split();

        // Handshake manually, then interleave an unknown stream with a
        // real notice.
        let manual = tokio::spawn(async move {
            writer
                .send(StreamId::Version.into(), VersionRecord::new(0).as_bytes())
                .await
                .unwrap();
            writer.send(57, b"noise").await.unwrap();
            let info = ProdInfo::new("p", ProdIndex::new(1), 1_000, 1_000).unwrap();
            let payload = {
                use hycast_core::Serial;
                info.to_bytes(0).unwrap()
            };
            writer
                .send(StreamId::ProdNotice.into(), &payload)
                .await
                .unwrap();
            writer
        });

        struct CountingRcvr(tokio::sync::mpsc::UnboundedSender<ProdInfo>);

        #[async_trait]
        impl PeerMsgRcvr for CountingRcvr {
            async fn recv_prod_notice(&self, info: ProdInfo, _peer: &Peer) {
                let _ = self.0.send(info);
            }
            async fn recv_chunk_notice(&self, _info: ChunkInfo, _peer: &Peer) {}
            async fn recv_prod_request(&self, _index: ProdIndex, _peer: &Peer) {}
            async fn recv_chunk_request(&self, _info: ChunkInfo, _peer: &Peer) {}
            async fn recv_data(&self, chunk: &mut LatentChunk, _peer: &Peer) {
                chunk.discard();
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let peer = Peer::start(b, Arc::new(CountingRcvr(tx))).await.unwrap();
        let _writer = manual.await.unwrap();

        let info = rx.recv().await.unwrap();
        assert_eq!(info.name(), "p");
        peer.close().await.unwrap();
    }
}
