//! Reactive list queries over the change feed.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{DownloadRecord, DownloadStatus, RecordStore, Result, StoreChange};

impl RecordStore {
    /// Returns a live view of a user's downloads in the given statuses.
    ///
    /// The receiver starts with the current rows and is refreshed after every
    /// download change for the user. The refresh task ends once every receiver
    /// has been dropped.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the initial query fails.
    pub async fn watch_downloads(
        &self,
        user_id: &str,
        statuses: &[DownloadStatus],
    ) -> Result<watch::Receiver<Vec<DownloadRecord>>> {
        // Subscribe before the initial read so no change slips between the two.
        let mut changes = self.subscribe_changes();
        let initial = self.list_downloads(user_id, statuses).await?;
        let (tx, rx) = watch::channel(initial);

        let store = self.clone();
        let user_id = user_id.to_string();
        let statuses = statuses.to_vec();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    change = changes.recv() => {
                        match change {
                            Ok(StoreChange::Downloads { user_id: changed }) if changed == user_id => {}
                            Ok(_) => continue,
                            Err(RecvError::Lagged(skipped)) => {
                                debug!(skipped, "download watch lagged, refreshing");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }

                match store.list_downloads(&user_id, &statuses).await {
                    Ok(rows) => {
                        tx.send_if_modified(|current| {
                            if *current == rows {
                                false
                            } else {
                                *current = rows;
                                true
                            }
                        });
                    }
                    Err(error) => warn!(user_id = %user_id, error = %error, "download watch refresh failed"),
                }
            }
            debug!(user_id = %user_id, "download watch closed");
        });

        Ok(rx)
    }
}
