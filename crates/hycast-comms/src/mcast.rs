//! Multicast send and receive.
//!
//! Each UDP datagram carries a one-byte message tag followed by either a
//! serialized product information record or a chunk record (chunk
//! information, then the raw body). A sender shards a product into one
//! information datagram plus one datagram per chunk; the receiver loop
//! decodes tags and hands content to a [`McastContentRcvr`].
//!
//! Datagrams may be lost, duplicated, or reordered; the store tolerates
//! all three, and a late joiner that never saw the information datagram
//! still assembles the product from its chunks alone.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use hycast_core::config::McastConfig;
use hycast_core::wire::{MSG_ID_CHUNK, MSG_ID_PROD_INFO};
use hycast_core::{ActualChunk, Decoder, Encoder, Error, LatentChunk, ProdInfo, Result, Serial};
use hycast_services::Product;

/// Largest datagram the receiver accepts: tag + chunk metadata + body.
const MAX_DATAGRAM: usize = 65536;

// ── Content receiver ─────────────────────────────────────────────────────────

/// What a multicast receiver does with decoded content.
#[async_trait]
pub trait McastContentRcvr: Send + Sync {
    async fn recv_prod_info(&self, info: ProdInfo);

    /// Must drain or discard the chunk before returning; the receive
    /// loop fails otherwise.
    async fn recv_chunk(&self, chunk: &mut LatentChunk);
}

// ── Datagram encoding ────────────────────────────────────────────────────────

fn prod_info_datagram(info: &ProdInfo, version: u32) -> Result<Bytes> {
    let mut enc = Encoder::with_capacity(1 + info.serial_size(version));
    enc.put_u8(MSG_ID_PROD_INFO);
    info.encode(&mut enc, version)?;
    Ok(enc.take())
}

fn chunk_datagram(chunk: &ActualChunk, version: u32) -> Result<Bytes> {
    let mut enc = Encoder::with_capacity(1 + chunk.serial_size(version));
    enc.put_u8(MSG_ID_CHUNK);
    chunk.encode(&mut enc, version)?;
    Ok(enc.take())
}

// ── Sender ───────────────────────────────────────────────────────────────────

/// Frames product information and chunks onto multicast datagrams.
pub struct McastSender {
    socket: UdpSocket,
    dest: SocketAddr,
    version: u32,
}

impl McastSender {
    /// Must be created within a tokio runtime.
    pub fn new(config: &McastConfig, version: u32) -> Result<Self> {
        let group = parse_group(config)?;
        let socket = make_send_socket(group, config)?;
        Ok(McastSender {
            socket,
            dest: SocketAddr::new(group, config.port),
            version,
        })
    }

    pub async fn send_prod_info(&self, info: &ProdInfo) -> Result<()> {
        let datagram = prod_info_datagram(info, self.version)?;
        self.socket.send_to(&datagram, self.dest).await?;
        Ok(())
    }

    pub async fn send_chunk(&self, chunk: &ActualChunk) -> Result<()> {
        let datagram = chunk_datagram(chunk, self.version)?;
        self.socket.send_to(&datagram, self.dest).await?;
        Ok(())
    }

    /// Ships a complete product: its information, then every chunk.
    pub async fn send_product(&self, product: &Product) -> Result<()> {
        let info = product.info();
        if !product.is_complete() {
            return Err(Error::logic(format!(
                "product {} is incomplete; {} of {} chunks",
                info.index(),
                product.received_count(),
                info.num_chunks()
            )));
        }
        self.send_prod_info(&info).await?;
        for index in 0..info.num_chunks() {
            let chunk = product
                .chunk(index)
                .ok_or_else(|| Error::logic(format!("chunk {index} vanished during send")))?;
            self.send_chunk(&chunk).await?;
        }
        tracing::debug!(
            prod_index = %info.index(),
            chunks = info.num_chunks(),
            "product multicast"
        );
        Ok(())
    }
}

// ── Receiver ─────────────────────────────────────────────────────────────────

/// Decodes multicast datagrams and dispatches their content.
pub struct McastReceiver {
    socket: UdpSocket,
    msg_rcvr: Arc<dyn McastContentRcvr>,
    version: u32,
}

impl McastReceiver {
    /// Joins the configured group (source-specific when a source address
    /// is configured). Must be created within a tokio runtime.
    pub fn new(
        config: &McastConfig,
        msg_rcvr: Arc<dyn McastContentRcvr>,
        version: u32,
    ) -> Result<Self> {
        let group = parse_group(config)?;
        let socket = make_recv_socket(group, config)?;
        Ok(McastReceiver {
            socket,
            msg_rcvr,
            version,
        })
    }

    /// Receives and dispatches datagrams until an error. An unknown
    /// message tag or an undrained chunk terminates the loop with the
    /// triggering error.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, _from) = self.socket.recv_from(&mut buf).await?;
            self.dispatch(Bytes::copy_from_slice(&buf[..len])).await?;
        }
    }

    async fn dispatch(&self, datagram: Bytes) -> Result<()> {
        let mut dec = Decoder::new(datagram);
        let msg_id = dec.u8()?;
        match msg_id {
            MSG_ID_PROD_INFO => {
                let info = ProdInfo::decode(&mut dec, self.version)?;
                self.msg_rcvr.recv_prod_info(info).await;
            }
            MSG_ID_CHUNK => {
                let mut chunk = LatentChunk::decode(&mut dec, self.version)?;
                self.msg_rcvr.recv_chunk(&mut chunk).await;
                if chunk.has_data() {
                    return Err(Error::logic("latent chunk still has data after dispatch"));
                }
            }
            other => {
                return Err(Error::runtime(format!(
                    "invalid multicast message type: {other}"
                )));
            }
        }
        Ok(())
    }
}

// ── Socket setup ─────────────────────────────────────────────────────────────

fn parse_group(config: &McastConfig) -> Result<IpAddr> {
    let group: IpAddr = config
        .group_addr
        .parse()
        .map_err(|_| Error::invalid_argument(format!("bad group address {:?}", config.group_addr)))?;
    if !group.is_multicast() {
        return Err(Error::invalid_argument(format!(
            "{group} is not a multicast address"
        )));
    }
    Ok(group)
}

fn make_send_socket(group: IpAddr, config: &McastConfig) -> Result<UdpSocket> {
    let domain = match group {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    match group {
        IpAddr::V4(_) => {
            socket.set_multicast_ttl_v4(config.hop_limit as u32)?;
            socket.set_multicast_loop_v4(config.loopback)?;
            socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0).into())?;
        }
        IpAddr::V6(_) => {
            socket.set_multicast_hops_v6(config.hop_limit as u32)?;
            socket.set_multicast_loop_v6(config.loopback)?;
            socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0).into())?;
        }
    }
    Ok(UdpSocket::from_std(socket.into())?)
}

fn make_recv_socket(group: IpAddr, config: &McastConfig) -> Result<UdpSocket> {
    let domain = match group {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    match group {
        IpAddr::V4(group) => {
            socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port).into())?;
            if config.source_addr.is_empty() {
                socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            } else {
                let source: Ipv4Addr = config.source_addr.parse().map_err(|_| {
                    Error::invalid_argument(format!(
                        "bad source address {:?}",
                        config.source_addr
                    ))
                })?;
                socket.join_ssm_v4(&source, &group, &Ipv4Addr::UNSPECIFIED)?;
            }
        }
        IpAddr::V6(group) => {
            socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), config.port).into())?;
            socket.join_multicast_v6(&group, 0)?;
        }
    }
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hycast_core::codec::PROTOCOL_VERSION;
    use hycast_core::{ChunkInfo, ProdIndex};
    use hycast_services::ProdStore;
    use parking_lot::Mutex;

    /// Feeds decoded multicast content straight into a product store,
    /// the way the daemon does.
    struct StoreRcvr(ProdStore);

    #[async_trait]
    impl McastContentRcvr for StoreRcvr {
        async fn recv_prod_info(&self, info: ProdInfo) {
            let _ = self.0.add_prod_info(&info);
        }
        async fn recv_chunk(&self, chunk: &mut LatentChunk) {
            let _ = self.0.add_latent_chunk(chunk);
        }
    }

    async fn loopback_receiver(msg_rcvr: Arc<dyn McastContentRcvr>) -> McastReceiver {
        // Datagram dispatch does not care how the socket was bound; a
        // plain loopback socket keeps these tests runnable anywhere.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        McastReceiver {
            socket,
            msg_rcvr,
            version: PROTOCOL_VERSION,
        }
    }

    #[tokio::test]
    async fn chunk_datagram_alone_creates_a_product() {
        let store = ProdStore::new(3600.0).unwrap();
        let receiver = loopback_receiver(Arc::new(StoreRcvr(store.clone()))).await;

        let info = ChunkInfo::new(ProdIndex::new(5), 65_536, 0).unwrap();
        let chunk = ActualChunk::new(info, Bytes::from(vec![0x6d; info.size() as usize])).unwrap();
        let datagram = chunk_datagram(&chunk, PROTOCOL_VERSION).unwrap();

        receiver.dispatch(datagram).await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.have_chunk(&info));
        // The information datagram was never seen.
        assert!(store.prod_info(ProdIndex::new(5)).is_none());
    }

    #[tokio::test]
    async fn info_datagram_attaches_metadata() {
        let store = ProdStore::new(3600.0).unwrap();
        let receiver = loopback_receiver(Arc::new(StoreRcvr(store.clone()))).await;

        let info = ProdInfo::new(
            "product",
            ProdIndex::new(9),
            1_000,
            hycast_core::canon_chunk_size(),
        )
        .unwrap();
        let datagram = prod_info_datagram(&info, PROTOCOL_VERSION).unwrap();
        receiver.dispatch(datagram).await.unwrap();

        assert_eq!(store.prod_info(ProdIndex::new(9)).unwrap(), info);
    }

    #[tokio::test]
    async fn unknown_message_tag_is_fatal() {
        let store = ProdStore::new(3600.0).unwrap();
        let receiver = loopback_receiver(Arc::new(StoreRcvr(store))).await;

        let err = receiver
            .dispatch(Bytes::from_static(&[0x77, 1, 2, 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(_)), "got {err}");
    }

    #[tokio::test]
    async fn undrained_chunk_is_a_logic_error() {
        struct LazyRcvr(Mutex<u32>);

        #[async_trait]
        impl McastContentRcvr for LazyRcvr {
            async fn recv_prod_info(&self, _info: ProdInfo) {}
            async fn recv_chunk(&self, _chunk: &mut LatentChunk) {
                *self.0.lock() += 1; // never drains
            }
        }

        let receiver = loopback_receiver(Arc::new(LazyRcvr(Mutex::new(0)))).await;
        let info = ChunkInfo::new(ProdIndex::new(1), 100, 0).unwrap();
        let chunk = ActualChunk::new(info, Bytes::from(vec![0u8; 100])).unwrap();
        let datagram = chunk_datagram(&chunk, PROTOCOL_VERSION).unwrap();

        let err = receiver.dispatch(datagram).await.unwrap_err();
        assert!(matches!(err, Error::Logic(_)), "got {err}");
    }

    #[tokio::test]
    async fn truncated_datagram_is_a_runtime_error() {
        let store = ProdStore::new(3600.0).unwrap();
        let receiver = loopback_receiver(Arc::new(StoreRcvr(store))).await;
        let err = receiver
            .dispatch(Bytes::from_static(&[MSG_ID_PROD_INFO, 0x01]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(_)), "got {err}");
    }
}
