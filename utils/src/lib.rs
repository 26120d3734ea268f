//! Shared concurrency primitives for the splitkey workspace.

mod concurrent_map;
pub use concurrent_map::ConcurrentMap;
mod set_once;
pub use set_once::SetOnce;
mod time;
pub use time::{from_epoch_millis, SystemTimeExt};

use thiserror::Error;

/// Errors returned by the containers in this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("already exists")]
    AlreadyExists,
    #[error("does not exist")]
    DoesNotExist,
}
