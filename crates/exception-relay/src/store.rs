//! Record store seam used by the publisher.

use crate::error::RelayResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exception_store::{ExceptionRecord, ExceptionStore};

/// Read pending records and persist the processed marker.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Up to `limit` pending records for `subject_key`, oldest occurrence
    /// first, ties broken by id.
    async fn pending_page(&self, subject_key: &str, limit: usize)
        -> RelayResult<Vec<ExceptionRecord>>;

    /// Stamp `ids` with `processed_at` atomically. Returns rows updated.
    async fn mark_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> RelayResult<usize>;
}

#[async_trait]
impl RecordStore for ExceptionStore {
    async fn pending_page(
        &self,
        subject_key: &str,
        limit: usize,
    ) -> RelayResult<Vec<ExceptionRecord>> {
        Ok(ExceptionStore::pending_page(self, subject_key, limit).await?)
    }

    async fn mark_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> RelayResult<usize> {
        Ok(ExceptionStore::mark_processed(self, ids.to_vec(), processed_at).await?)
    }
}
