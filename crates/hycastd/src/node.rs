//! Receiver-node policy: routes multicast and peer traffic into the
//! store and answers peer requests from it.
//!
//! The rules are simple. A notice for something we lack turns into a
//! request on the same session. A request is served from the store when
//! we can. Arriving data goes into the store, and a chunk we had not
//! seen before is advertised to every other live peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use hycast_comms::{McastContentRcvr, Peer, PeerMsgRcvr};
use hycast_core::{ChunkInfo, LatentChunk, ProdIndex, ProdInfo};
use hycast_services::ProdStore;

pub struct Node {
    store: ProdStore,
    /// Live peer sessions by peer id.
    peers: DashMap<u64, Peer>,
}

impl Node {
    pub fn new(store: ProdStore) -> Arc<Self> {
        Arc::new(Node {
            store,
            peers: DashMap::new(),
        })
    }

    pub fn store(&self) -> &ProdStore {
        &self.store
    }

    pub fn register_peer(&self, peer: Peer) {
        self.peers.insert(peer.id(), peer);
    }

    pub fn unregister_peer(&self, id: u64) {
        self.peers.remove(&id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn live_peers(&self) -> Vec<Peer> {
        // Clone out of the map; holding shard locks across sends would
        // stall the dispatch loops.
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Asks every live peer for the given chunk, dropping sessions whose
    /// send side has failed.
    pub async fn request_chunk(&self, info: &ChunkInfo) {
        for peer in self.live_peers() {
            if let Err(err) = peer.send_chunk_request(info).await {
                tracing::debug!(peer_id = peer.id(), error = %err, "dropping dead peer");
                self.unregister_peer(peer.id());
            }
        }
    }

    /// Advertises a chunk to every peer except the one it came from.
    async fn notice_chunk_to_others(&self, info: &ChunkInfo, origin: Option<&Peer>) {
        for peer in self.live_peers() {
            if origin.is_some_and(|o| *o == peer) {
                continue;
            }
            if let Err(err) = peer.send_chunk_notice(info).await {
                tracing::debug!(peer_id = peer.id(), error = %err, "dropping dead peer");
                self.unregister_peer(peer.id());
            }
        }
    }

    /// Periodically turns the store's oldest gap into request traffic.
    pub async fn repair_loop(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Some(missing) = self.store.oldest_missing_chunk() {
                tracing::debug!(chunk = %missing, "requesting oldest missing chunk");
                self.request_chunk(&missing).await;
            }
        }
    }

    fn ingest_prod_info(&self, info: &ProdInfo) {
        match self.store.add_prod_info(info) {
            Ok((status, _)) if status.is_complete() && status.is_new() => {
                tracing::info!(prod_index = %info.index(), name = info.name(), "product complete");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(prod_index = %info.index(), error = %err, "rejected product information");
            }
        }
    }

    /// Stores an arriving chunk. Returns its info when it was new.
    fn ingest_chunk(&self, chunk: &mut LatentChunk) -> Option<ChunkInfo> {
        let info = *chunk.info();
        match self.store.add_latent_chunk(chunk) {
            Ok((status, product)) => {
                if status.is_complete() && status.is_new() {
                    tracing::info!(
                        prod_index = %info.prod_index(),
                        name = product.info().name(),
                        "product complete"
                    );
                }
                status.is_new().then_some(info)
            }
            Err(err) => {
                tracing::warn!(chunk = %info, error = %err, "rejected chunk");
                chunk.discard();
                None
            }
        }
    }
}

// ── Peer traffic ─────────────────────────────────────────────────────────────

#[async_trait]
impl PeerMsgRcvr for Node {
    async fn recv_prod_notice(&self, info: ProdInfo, _peer: &Peer) {
        self.ingest_prod_info(&info);
    }

    async fn recv_chunk_notice(&self, info: ChunkInfo, peer: &Peer) {
        if !self.store.have_chunk(&info) {
            if let Err(err) = peer.send_chunk_request(&info).await {
                tracing::debug!(peer_id = peer.id(), error = %err, "chunk request failed");
            }
        }
    }

    async fn recv_prod_request(&self, index: ProdIndex, peer: &Peer) {
        if let Some(info) = self.store.prod_info(index) {
            if let Err(err) = peer.send_prod_notice(&info).await {
                tracing::debug!(peer_id = peer.id(), error = %err, "prod notice failed");
            }
        }
    }

    async fn recv_chunk_request(&self, info: ChunkInfo, peer: &Peer) {
        if let Some(chunk) = self.store.chunk(&info) {
            if let Err(err) = peer.send_data(&chunk).await {
                tracing::debug!(peer_id = peer.id(), error = %err, "chunk send failed");
            }
        }
    }

    async fn recv_data(&self, chunk: &mut LatentChunk, peer: &Peer) {
        if let Some(info) = self.ingest_chunk(chunk) {
            self.notice_chunk_to_others(&info, Some(peer)).await;
        }
    }
}

// ── Multicast traffic ────────────────────────────────────────────────────────

#[async_trait]
impl McastContentRcvr for Node {
    async fn recv_prod_info(&self, info: ProdInfo) {
        self.ingest_prod_info(&info);
    }

    async fn recv_chunk(&self, chunk: &mut LatentChunk) {
        if let Some(info) = self.ingest_chunk(chunk) {
            self.notice_chunk_to_others(&info, None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hycast_comms::RecordSock;
    use hycast_core::ActualChunk;
    use hycast_services::Product;
    use std::time::Duration;

    fn store() -> ProdStore {
        ProdStore::new(3600.0).unwrap()
    }

    fn seeded_product(index: u32, size: u32) -> Product {
        let info = ProdInfo::new(
            format!("p{index}"),
            ProdIndex::new(index),
            size,
            hycast_core::canon_chunk_size(),
        )
        .unwrap();
        let product = Product::new(info.clone());
        for i in 0..info.num_chunks() {
            let len = info.chunk_size_at(i).unwrap() as usize;
            product
                .add_chunk(
                    &ActualChunk::new(info.chunk_info(i).unwrap(), Bytes::from(vec![0x42; len]))
                        .unwrap(),
                )
                .unwrap();
        }
        product
    }

    /// Connect two nodes over an in-memory transport. Each node's store
    /// drives its side of the protocol.
    async fn connected_nodes() -> (Arc<Node>, Arc<Node>, Peer, Peer) {
        let node_a = Node::new(store());
        let node_b = Node::new(store());
        let (sock_a, sock_b) = RecordSock::pair();
        let (peer_a, peer_b) = tokio::join!(
            Peer::start(sock_a, node_a.clone()),
            Peer::start(sock_b, node_b.clone()),
        );
        let peer_a = peer_a.unwrap();
        let peer_b = peer_b.unwrap();
        node_a.register_peer(peer_a.clone());
        node_b.register_peer(peer_b.clone());
        (node_a, node_b, peer_a, peer_b)
    }

    async fn eventually(mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached within 5 s"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn notice_request_data_fills_the_remote_store() {
        let (node_a, node_b, peer_a, _peer_b) = connected_nodes().await;

        let product = seeded_product(2, 40_000);
        let info = product.info();
        node_a.store().add_product(product);

        // A advertises each chunk; B requests and stores them.
        for i in 0..info.num_chunks() {
            peer_a
                .send_chunk_notice(&info.chunk_info(i).unwrap())
                .await
                .unwrap();
        }

        let expected = info.clone();
        eventually(|| {
            (0..expected.num_chunks())
                .all(|i| node_b.store().have_chunk(&expected.chunk_info(i).unwrap()))
        })
        .await;
    }

    #[tokio::test]
    async fn prod_request_returns_metadata() {
        let (node_a, node_b, _peer_a, peer_b) = connected_nodes().await;

        let product = seeded_product(3, 5_000);
        let info = product.info();
        node_a.store().add_product(product);

        peer_b.send_prod_request(info.index()).await.unwrap();

        let expected = info.clone();
        eventually(|| node_b.store().prod_info(expected.index()).is_some()).await;
        assert_eq!(node_b.store().prod_info(info.index()).unwrap(), info);
    }

    #[tokio::test]
    async fn repair_requests_fill_gaps() {
        let (node_a, node_b, _peer_a, _peer_b) = connected_nodes().await;

        // A holds the whole product; B knows the metadata only.
        let product = seeded_product(4, 70_000);
        let info = product.info();
        node_a.store().add_product(product);
        node_b.store().add_prod_info(&info).unwrap();

        let repairer = {
            let node_b = node_b.clone();
            tokio::spawn(async move { node_b.repair_loop(Duration::from_millis(50)).await })
        };

        let expected = info.clone();
        eventually(|| node_b.store().oldest_missing_chunk().is_none()).await;
        for i in 0..expected.num_chunks() {
            assert!(node_b.store().have_chunk(&expected.chunk_info(i).unwrap()));
        }
        repairer.abort();
    }
}
