pub mod clock;
mod matrix;
mod query;
mod snapshot;
mod store;

pub use query::{coarsen, CellRect, QueryError};
pub use snapshot::{Snapshot, SnapshotError};
pub use store::MotionStore;
