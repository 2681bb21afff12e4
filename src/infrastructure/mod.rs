//! Reusable leaf components: hash functions, the per-pair lock, and the
//! asynchronous work queue / thread pool.

pub mod hash;
pub mod pairlock;
pub mod workqueue;
