//! Idempotent stream and consumer-group setup, run before the consumer starts.

use crate::error::RelayResult;
use crate::stream::{GroupStatus, StreamBackend};
use tracing::{debug, info};

/// Field written into the seed entry of a freshly created stream.
pub const SEED_FIELD: &str = "init";

/// Make sure the stream and the consumer group exist.
///
/// A missing stream gets a seed entry first. The group is created at the
/// latest id, so the seed is never delivered to it. An existing group counts
/// as success.
pub async fn ensure_stream_and_group(stream: &dyn StreamBackend) -> RelayResult<GroupStatus> {
    match stream.stream_exists().await {
        Ok(true) => {}
        Ok(false) => {
            let seed = [(SEED_FIELD.to_string(), "1".to_string())];
            match stream.append(&seed).await {
                Ok(id) => info!(stream = %stream.stream_name(), entry_id = %id, "Seeded stream"),
                Err(e) => debug!(stream = %stream.stream_name(), error = %e, "Stream seed failed"),
            }
        }
        Err(e) => debug!(stream = %stream.stream_name(), error = %e, "Stream existence check failed"),
    }

    let status = stream.ensure_group().await?;
    match status {
        GroupStatus::Created => info!(stream = %stream.stream_name(), "Consumer group ready"),
        GroupStatus::AlreadyExists => {
            info!(stream = %stream.stream_name(), "Consumer group already exists")
        }
    }
    Ok(status)
}
