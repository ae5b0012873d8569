//! Byte transfer for a single download.
//!
//! [`TransferWorker`] is the [`crate::Worker`] the scheduler runs for every
//! admitted download. It streams the item's video into a partial file in the
//! download directory, reports monotone progress to the
//! [`crate::DownloadRepository`], and finally renames the file and completes
//! the record. Failures are classified into [`FailureType`]s to decide between
//! a scheduler retry and a terminal `Failed` write.

mod error;
mod failure;
mod paths;
mod worker;

pub use error::TransferError;
pub use failure::{FailureType, classify_error, parse_retry_after};
pub use paths::DownloadPaths;
pub use worker::TransferWorker;

use serde::{Deserialize, Serialize};

/// Name transfer units are enqueued under.
pub const TRANSFER_WORKER: &str = "transfer";

/// Payload of a transfer unit.
///
/// The user and media ids let a unit kept alive by enqueue-unique pick up a
/// newer active download of the same item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub download_id: String,
    pub user_id: String,
    pub media_item_id: String,
}
