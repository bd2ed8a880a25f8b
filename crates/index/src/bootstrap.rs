use crate::client::AdIndex;
use std::time::Duration;
use tracing::{error, info};

/// Make sure the index exists before anything reads or writes it.
///
/// With `reset` the index is dropped and recreated first. Retries forever
/// with a fixed delay; the service is useless without its index.
pub async fn bootstrap_index(index: &dyn AdIndex, reset: bool, retry_delay: Duration) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let result = if reset {
            index.reset_index().await
        } else {
            index.ensure_index().await
        };

        match result {
            Ok(()) => {
                info!(attempt, reset, "Index ready");
                return;
            }
            Err(e) => {
                error!(
                    attempt,
                    error = %e,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "Index bootstrap failed, retrying"
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}
