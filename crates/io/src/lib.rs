// Session snapshot I/O

pub mod error;
pub mod snapshot;
pub mod store;

pub use error::SnapshotError;
pub use snapshot::{
    compress, decompress, filter_by_owner, reactivate, snapshot_sheet, CompressedSnapshot, SessionBody,
    SessionState, WorksheetState,
};
pub use store::SnapshotStore;
