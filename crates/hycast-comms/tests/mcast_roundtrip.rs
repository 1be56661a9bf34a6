//! Multicast over real sockets on a loopback-enabled group.
//!
//! Containers and CI runners do not always route multicast; these tests
//! skip gracefully when the environment cannot deliver a datagram at
//! all, and only fail on partial or wrong delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use hycast_comms::{McastContentRcvr, McastReceiver, McastSender};
use hycast_core::codec::PROTOCOL_VERSION;
use hycast_core::config::McastConfig;
use hycast_core::{LatentChunk, ProdIndex, ProdInfo};
use hycast_services::{ProdStore, Product};

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

fn test_config() -> McastConfig {
    McastConfig {
        group_addr: "232.16.77.7".to_string(),
        port: 39877,
        source_addr: String::new(),
        hop_limit: 1,
        loopback: true,
    }
}

fn build_product(index: u32, size: u32) -> Product {
    let info = ProdInfo::new(
        format!("mcast-{index}"),
        ProdIndex::new(index),
        size,
        hycast_core::canon_chunk_size(),
    )
    .unwrap();
    let product = Product::new(info.clone());
    for i in 0..info.num_chunks() {
        let len = info.chunk_size_at(i).unwrap() as usize;
        let chunk = hycast_core::ActualChunk::new(
            info.chunk_info(i).unwrap(),
            Bytes::from(vec![i as u8 + 1; len]),
        )
        .unwrap();
        product.add_chunk(&chunk).unwrap();
    }
    product
}

#[tokio::test]
async fn product_multicast_reassembles_in_the_store() {
    let config = test_config();
    let store = ProdStore::new(3600.0).unwrap();

    let receiver = match McastReceiver::new(&config, Arc::new(StoreRcvr(store.clone())), PROTOCOL_VERSION)
    {
        Ok(receiver) => Arc::new(receiver),
        Err(err) => {
            eprintln!("SKIP: cannot join multicast group here: {err}");
            return;
        }
    };
    let sender = match McastSender::new(&config, PROTOCOL_VERSION) {
        Ok(sender) => sender,
        Err(err) => {
            eprintln!("SKIP: cannot open multicast sender here: {err}");
            return;
        }
    };

    let run = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.run().await })
    };

    // Let the group join settle before the first datagram.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let product = build_product(21, 70_000);
    sender.send_product(&product).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if store
            .prod_info(ProdIndex::new(21))
            .is_some_and(|_| store.oldest_missing_chunk().is_none())
        {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            if store.is_empty() {
                eprintln!("SKIP: no multicast datagram arrived; environment has no loopback multicast");
                run.abort();
                return;
            }
            panic!(
                "partial delivery: {} products, oldest missing {:?}",
                store.len(),
                store.oldest_missing_chunk()
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let info = store.prod_info(ProdIndex::new(21)).unwrap();
    assert_eq!(info.name(), "mcast-21");
    assert_eq!(info.size(), 70_000);
    for i in 0..info.num_chunks() {
        assert!(store.have_chunk(&info.chunk_info(i).unwrap()));
    }

    run.abort();
}
