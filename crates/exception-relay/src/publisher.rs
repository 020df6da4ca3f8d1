//! Paged outbox publisher.
//!
//! A run drains every pending record for one subject key:
//!
//! ```text
//! loop:
//!   page = head of pending set (oldest first, LIMIT page_size)
//!   empty?            -> done
//!   publish all       -> any failure aborts the run, page stays pending
//!   mark page processed in one transaction
//! ```
//!
//! The head of the pending set is re-read on every iteration. Committed rows
//! drop out of the predicate, so no offset is needed and no row is skipped.

use crate::bus::{MessageBus, OutboundMessage, PublishReceipt};
use crate::config::MIN_PAGE_SIZE;
use crate::error::{RelayError, RelayResult};
use crate::store::RecordStore;
use chrono::Utc;
use exception_store::ExceptionRecord;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a completed publisher run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub subject_key: String,
    /// Pages committed
    pub pages: usize,
    /// Records published and marked processed
    pub published: usize,
}

impl PublishSummary {
    fn new(subject_key: &str) -> Self {
        Self {
            subject_key: subject_key.to_string(),
            ..Default::default()
        }
    }

    /// Fold another pass over the same key into this summary.
    pub fn absorb(&mut self, other: PublishSummary) {
        self.pages += other.pages;
        self.published += other.published;
    }
}

/// Publishes pending exception records and commits the processed marker.
pub struct OutboxPublisher {
    store: Arc<dyn RecordStore>,
    bus: Arc<dyn MessageBus>,
    topic: String,
    page_size: usize,
}

impl OutboxPublisher {
    /// `page_size` is raised to [`MIN_PAGE_SIZE`] if smaller.
    pub fn new(
        store: Arc<dyn RecordStore>,
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            bus,
            topic: topic.into(),
            page_size: page_size.max(MIN_PAGE_SIZE),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Publish every pending record for `subject_key`, page by page.
    ///
    /// Pages committed before a failure stay committed.
    pub async fn publish_all(&self, subject_key: &str) -> RelayResult<PublishSummary> {
        let mut summary = PublishSummary::new(subject_key);
        let mut committed: HashSet<i64> = HashSet::new();

        loop {
            let page = self.store.pending_page(subject_key, self.page_size).await?;
            if page.is_empty() {
                break;
            }

            if let Some(record) = page.iter().find(|r| committed.contains(&r.id)) {
                return Err(RelayError::StalledPagination {
                    subject_key: subject_key.to_string(),
                    record_id: record.id,
                });
            }

            self.publish_page(subject_key, &page).await?;

            let ids: Vec<i64> = page.iter().map(|r| r.id).collect();
            let updated = self.store.mark_processed(&ids, Utc::now()).await?;
            if updated < ids.len() {
                // Another instance committed part of this page first.
                debug!(
                    subject_key = %subject_key,
                    page_len = ids.len(),
                    updated,
                    "Some records were already processed"
                );
            }

            summary.pages += 1;
            summary.published += ids.len();
            committed.extend(ids);

            debug!(
                subject_key = %subject_key,
                page = summary.pages,
                published = summary.published,
                "Committed page"
            );
        }

        info!(
            subject_key = %subject_key,
            pages = summary.pages,
            published = summary.published,
            "Outbox publish complete"
        );
        Ok(summary)
    }

    /// Publish every record of the page concurrently and wait for all of them.
    async fn publish_page(&self, subject_key: &str, page: &[ExceptionRecord]) -> RelayResult<()> {
        let sends = page.iter().map(|record| self.publish_record(record));
        let results = join_all(sends).await;

        let mut failed = 0;
        for (record, result) in page.iter().zip(&results) {
            if let Err(e) = result {
                failed += 1;
                warn!(
                    subject_key = %subject_key,
                    record_id = record.id,
                    error = %e,
                    "Publish failed"
                );
            }
        }

        if failed > 0 {
            return Err(RelayError::PageAborted {
                subject_key: subject_key.to_string(),
                failed,
                total: page.len(),
            });
        }
        Ok(())
    }

    async fn publish_record(&self, record: &ExceptionRecord) -> RelayResult<PublishReceipt> {
        let message = OutboundMessage::from(record);
        let payload = message.to_json()?;
        let key = message.key();

        let receipt = self.bus.publish(&self.topic, &key, &payload).await?;
        debug!(
            record_id = record.id,
            topic = %self.topic,
            key = %key,
            partition = receipt.partition,
            offset = receipt.offset,
            "Published exception record"
        );
        Ok(receipt)
    }
}
