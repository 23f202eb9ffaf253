//! Offline-first data core for a food diary.
//!
//! Entries live in a local cache backed by a durable key-value store.
//! Every mutation succeeds locally and queues replay work that a sync
//! engine pushes to the remote API once connectivity allows.

pub mod config;
pub mod error;
pub mod model;
pub mod remote;
pub mod repo;
pub mod storage;
pub mod store;
pub mod sync;

pub use error::DiaryError;
pub use repo::FoodDiaryRepository;
