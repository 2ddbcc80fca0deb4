//! Transfer lifecycle, chunk streaming, and progress tracking.

mod estimator;
mod manager;
mod receiver;
mod record;
mod sender;

pub use estimator::SpeedEstimator;
pub use manager::TransferManager;
pub use record::{TransferDirection, TransferRecord, TransferSnapshot, TransferStatus};
