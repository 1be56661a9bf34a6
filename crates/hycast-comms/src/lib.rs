//! hycast-comms — the peer protocol and multicast transport.
//!
//! Peers exchange notices, requests, and chunk data over six logical
//! streams of a reliable record transport; the multicast side ships the
//! same product-information and chunk payloads in tagged UDP datagrams.

pub mod channel;
pub mod mcast;
pub mod peer;
pub mod sock;

pub use channel::{Channel, ChunkChannel};
pub use mcast::{McastContentRcvr, McastReceiver, McastSender};
pub use peer::{Peer, PeerMsgRcvr, PeerState};
pub use sock::{RecordReader, RecordSock, RecordWriter};
