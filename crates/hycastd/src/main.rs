//! hycastd — Hycast receiver/redistribution daemon.
//!
//! Wires the product store to a multicast receiver and a set of peer
//! sessions. Multicast fills the store in bulk; peers patch the holes
//! multicast left behind and serve our chunks to late joiners.

use std::time::Duration;

use anyhow::{Context, Result};

use hycast_comms::{McastReceiver, Peer, RecordSock};
use hycast_core::codec::PROTOCOL_VERSION;
use hycast_core::config::HycastConfig;
use hycast_services::{PeerSource, ProdStore};

mod node;

use node::Node;

/// How often the repair tick turns store gaps into chunk requests.
const REPAIR_PERIOD: Duration = Duration::from_secs(1);

/// How often the connector retries unconnected peer candidates.
const CONNECT_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => HycastConfig::load_from(std::path::Path::new(&path))
            .with_context(|| format!("failed to load config from {path}"))?,
        None => {
            let path =
                HycastConfig::write_default_if_missing().context("failed to write default config")?;
            tracing::debug!(path = %path.display(), "config file");
            HycastConfig::load().context("failed to load config")?
        }
    };
    tracing::info!(
        group = %config.mcast.group_addr,
        port = config.mcast.port,
        peers = config.peers.len(),
        "hycastd starting"
    );

    let store = ProdStore::with_snapshot(
        config.store.snapshot_path.clone(),
        config.store.residence_seconds,
    )
    .context("failed to open product store")?;
    let node = Node::new(store.clone());

    // Multicast ingest.
    let mcast_task = {
        let receiver = McastReceiver::new(&config.mcast, node.clone(), PROTOCOL_VERSION)
            .context("failed to join multicast group")?;
        tokio::spawn(async move {
            if let Err(err) = receiver.run().await {
                tracing::error!(error = %err, "multicast receiver failed");
            }
        })
    };

    // Inbound peer sessions.
    let listener_task = {
        let node = node.clone();
        let listen_addr = config.p2p.listen_addr.clone();
        tokio::spawn(async move {
            if listen_addr.is_empty() {
                return;
            }
            let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(addr = %listen_addr, error = %err, "p2p listener bind failed");
                    return;
                }
            };
            tracing::info!(addr = %listen_addr, "p2p listener ready");
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            match Peer::start(RecordSock::from_tcp(stream), node.clone()).await {
                                Ok(peer) => {
                                    tracing::info!(%peer_addr, peer_id = peer.id(), "peer session accepted");
                                    node.register_peer(peer.clone());
                                    if let Err(err) = peer.join().await {
                                        tracing::warn!(peer_id = peer.id(), error = %err, "peer session failed");
                                    }
                                    node.unregister_peer(peer.id());
                                }
                                Err(err) => {
                                    tracing::warn!(%peer_addr, error = %err, "peer handshake failed");
                                }
                            }
                        });
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                }
            }
        })
    };

    // Outbound sessions to configured peers.
    let connector_task = {
        let node = node.clone();
        let source = PeerSource::new(config.peers.clone());
        tokio::spawn(async move {
            if source.is_empty() {
                return;
            }
            let mut interval = tokio::time::interval(CONNECT_PERIOD);
            loop {
                interval.tick().await;
                if node.peer_count() >= source.len() {
                    continue;
                }
                let Some(addr) = source.next() else { return };
                let target = format!("{}:{}", addr.host, addr.port);
                let stream = match tokio::net::TcpStream::connect(&target).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::debug!(%target, error = %err, "peer connect failed");
                        continue;
                    }
                };
                match Peer::start(RecordSock::from_tcp(stream), node.clone()).await {
                    Ok(peer) => {
                        tracing::info!(%target, peer_id = peer.id(), "peer session connected");
                        node.register_peer(peer.clone());
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(err) = peer.join().await {
                                tracing::warn!(peer_id = peer.id(), error = %err, "peer session failed");
                            }
                            node.unregister_peer(peer.id());
                        });
                    }
                    Err(err) => tracing::warn!(%target, error = %err, "peer handshake failed"),
                }
            }
        })
    };

    // Repair tick: oldest missing chunk becomes request traffic.
    let repair_task = {
        let node = node.clone();
        tokio::spawn(async move { node.repair_loop(REPAIR_PERIOD).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        r = mcast_task => tracing::error!("multicast task exited: {r:?}"),
        r = listener_task => tracing::error!("listener task exited: {r:?}"),
        r = connector_task => tracing::error!("connector task exited: {r:?}"),
        r = repair_task => tracing::error!("repair task exited: {r:?}"),
    }

    store.close().context("failed to close product store")?;
    Ok(())
}
