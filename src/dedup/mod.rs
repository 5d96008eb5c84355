use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{DedupConfig, IdentityConfig};
use crate::errors::{CourierError, CourierResult};
use crate::identity::{self, Platform, SenderKind};
use crate::store::{Contact, MergeStats, Store};

/// Outcome of one batch sweep over the whole store.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub phone_groups: usize,
    pub contacts_merged: usize,
    pub conversations_collapsed: usize,
    /// Groups left for manual review after the retry budget ran out.
    pub failed_groups: usize,
}

/// Detects contacts and conversations that represent one party and merges
/// them, preserving every message. Runs as an online repair (after a phone
/// back-fill) and as a batch sweep; both paths go through the same merge
/// procedure, so one code path defines what a merge means.
pub struct DuplicateResolver {
    store: Arc<dyn Store>,
    identity: IdentityConfig,
    merge_max_attempts: u32,
}

impl DuplicateResolver {
    pub fn new(store: Arc<dyn Store>, identity: IdentityConfig, dedup: &DedupConfig) -> Self {
        Self {
            store,
            identity,
            merge_max_attempts: dedup.merge_max_attempts.max(1),
        }
    }

    /// Fold every contact sharing `phone` into a single primary. Returns
    /// how many duplicates were merged away.
    pub async fn merge_contacts_by_phone(
        &self,
        platform: Platform,
        phone: &str,
    ) -> CourierResult<usize> {
        let contacts = self.store.contacts_by_phone(platform, phone).await?;
        if contacts.len() < 2 {
            return Ok(0);
        }

        let primary = pick_primary(&contacts, &self.identity);
        info!(
            "merging {} duplicate contact(s) for phone {} into contact {}",
            contacts.len() - 1,
            phone,
            primary.id
        );

        let mut merged = 0usize;
        for duplicate in contacts.iter().filter(|c| c.id != primary.id) {
            let stats = self
                .merge_with_retry(primary.id, duplicate.id, phone)
                .await?;
            info!(
                "contact {} folded into {}: {} conversation(s) reassigned, {} removed, {} message(s) moved",
                duplicate.id,
                primary.id,
                stats.conversations_reassigned,
                stats.conversations_removed,
                stats.messages_moved
            );
            merged += 1;
        }

        // A reassigned OPEN conversation can land next to one the primary
        // already had; collapse the survivors.
        self.merge_open_conversations(primary.id).await?;
        Ok(merged)
    }

    /// Collapse multiple OPEN conversations of one contact (per
    /// integration) into the most recently active one.
    pub async fn merge_open_conversations(&self, contact_id: i64) -> CourierResult<usize> {
        let merged = self.store.collapse_open_conversations(contact_id).await?;
        if merged > 0 {
            info!(
                "collapsed {} redundant open conversation(s) for contact {}",
                merged, contact_id
            );
        }
        Ok(merged)
    }

    /// Batch sweep: merge every duplicate phone group and collapse stray
    /// duplicate OPEN conversations. A group that exhausts its retry budget
    /// is logged and skipped so the rest of the sweep still runs.
    pub async fn sweep(&self) -> CourierResult<SweepReport> {
        let mut report = SweepReport::default();

        let groups = self.store.duplicate_phone_groups().await?;
        report.phone_groups = groups.len();
        for (platform, phone) in groups {
            match self.merge_contacts_by_phone(platform, &phone).await {
                Ok(merged) => report.contacts_merged += merged,
                Err(err @ CourierError::MergeConflict { .. }) => {
                    error!("sweep: {} — left for manual review", err);
                    report.failed_groups += 1;
                }
                Err(err) => return Err(err),
            }
        }

        for contact_id in self.store.contacts_with_multiple_open_conversations().await? {
            report.conversations_collapsed += self.merge_open_conversations(contact_id).await?;
        }

        info!(
            "sweep done: {} phone group(s), {} contact(s) merged, {} conversation(s) collapsed, {} group(s) failed",
            report.phone_groups,
            report.contacts_merged,
            report.conversations_collapsed,
            report.failed_groups
        );
        Ok(report)
    }

    /// One merge, retried a bounded number of times on retryable storage
    /// failures, then surfaced as a `MergeConflict`.
    async fn merge_with_retry(
        &self,
        primary_id: i64,
        duplicate_id: i64,
        phone: &str,
    ) -> CourierResult<MergeStats> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.merge_contact_into(primary_id, duplicate_id).await {
                Ok(stats) => return Ok(stats),
                Err(err) if err.is_retryable() && attempt < self.merge_max_attempts => {
                    warn!(
                        "merge of contact {} into {} failed (attempt {}/{}): {}",
                        duplicate_id, primary_id, attempt, self.merge_max_attempts, err
                    );
                }
                Err(err) if err.is_retryable() => {
                    return Err(CourierError::MergeConflict {
                        phone: phone.to_string(),
                        attempts: attempt,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Deterministic primary selection: prefer a contact whose identifier
/// normalizes to INDIVIDUAL over opaque-origin ones, then the oldest, then
/// the lowest id.
fn pick_primary<'a>(contacts: &'a [Contact], identity: &IdentityConfig) -> &'a Contact {
    contacts
        .iter()
        .min_by_key(|c| {
            let kind = identity::normalize(c.platform, &c.platform_id, identity).kind;
            let opaque_origin = kind != SenderKind::Individual;
            (opaque_origin, c.created_at, c.id)
        })
        .expect("pick_primary called with a non-empty group")
}

#[cfg(test)]
mod tests;
