//! hycast-services — product reassembly, the product store, and the
//! concurrency utilities the store is built on.

pub mod delay_queue;
pub mod exec;
pub mod peer_source;
pub mod product;
pub mod store;

pub use delay_queue::DelayQueue;
pub use exec::{Completer, Executor, Future, Task};
pub use peer_source::PeerSource;
pub use product::{AddStatus, Product};
pub use store::{ChunkInfoIter, ProdStore};
