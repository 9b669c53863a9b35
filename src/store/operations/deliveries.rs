use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_CAS_RETRIES;
use crate::store::keys;
use crate::store::operations::subscribers::Recipient;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Claimed by a poll run, send not yet confirmed.
    Pending,
    Delivered,
}

/// One ledger row per (paper, recipient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub arxiv_id: String,
    pub recipient: Recipient,
    pub status: DeliveryStatus,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the row and must confirm or release it.
    Claimed,
    AlreadyDelivered,
    /// Another run holds a fresh claim.
    InFlight,
}

fn delivery_key_for(arxiv_id: &str, recipient: &Recipient) -> Result<String, StoreError> {
    keys::delivery_key(arxiv_id, recipient.platform.as_str(), &recipient.chat_id)
}

impl Store {
    pub fn claim_delivery(
        &self,
        arxiv_id: &str,
        recipient: &Recipient,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let key = delivery_key_for(arxiv_id, recipient)?;
        let fresh = DeliveryRecord {
            arxiv_id: arxiv_id.to_string(),
            recipient: recipient.clone(),
            status: DeliveryStatus::Pending,
            claimed_at: now,
            notified_at: None,
        };
        let fresh_bytes = Self::serialize(&fresh)?;

        for _ in 0..MAX_CAS_RETRIES {
            let current_raw = self.deliveries.get(key.as_bytes())?;
            if let Some(raw) = &current_raw {
                let current: DeliveryRecord = Self::deserialize(raw)?;
                match current.status {
                    DeliveryStatus::Delivered => return Ok(ClaimOutcome::AlreadyDelivered),
                    DeliveryStatus::Pending if now - current.claimed_at < stale_after => {
                        return Ok(ClaimOutcome::InFlight);
                    }
                    DeliveryStatus::Pending => {
                        tracing::warn!(
                            arxiv_id,
                            recipient = %recipient,
                            claimed_at = %current.claimed_at,
                            "Re-claiming stale delivery"
                        );
                    }
                }
            }

            match self.deliveries.compare_and_swap(
                key.as_bytes(),
                current_raw,
                Some(fresh_bytes.clone()),
            )? {
                Ok(()) => return Ok(ClaimOutcome::Claimed),
                Err(_) => continue,
            }
        }

        Err(StoreError::CasRetryExhausted {
            entity: "delivery".to_string(),
            key,
            attempts: MAX_CAS_RETRIES,
        })
    }

    /// Marks the row delivered and records it in the per-recipient index.
    pub fn confirm_delivery(
        &self,
        arxiv_id: &str,
        recipient: &Recipient,
        at: DateTime<Utc>,
    ) -> Result<DeliveryRecord, StoreError> {
        let key = delivery_key_for(arxiv_id, recipient)?;
        let record = Self::cas_update::<DeliveryRecord, _>(&self.deliveries, "delivery", &key, |cur| {
            let record = match cur {
                Some(existing) if existing.status == DeliveryStatus::Delivered => existing,
                Some(existing) => DeliveryRecord {
                    status: DeliveryStatus::Delivered,
                    notified_at: Some(at),
                    ..existing
                },
                // claim vanished (stale cleanup raced the send); the message went out regardless
                None => DeliveryRecord {
                    arxiv_id: arxiv_id.to_string(),
                    recipient: recipient.clone(),
                    status: DeliveryStatus::Delivered,
                    claimed_at: at,
                    notified_at: Some(at),
                },
            };
            Ok(Some(record))
        })?
        .ok_or_else(|| StoreError::NotFound {
            entity: "delivery".to_string(),
            key: key.clone(),
        })?;

        let notified_at = record.notified_at.unwrap_or(at);
        let index_key = keys::recipient_delivery_key(
            recipient.platform.as_str(),
            &recipient.chat_id,
            notified_at.timestamp_millis(),
            arxiv_id,
        )?;
        self.deliveries_by_recipient
            .insert(index_key.as_bytes(), arxiv_id.as_bytes())?;

        Ok(record)
    }

    /// Drops a pending claim so the next run retries. Delivered rows are left alone.
    pub fn release_delivery(&self, arxiv_id: &str, recipient: &Recipient) -> Result<bool, StoreError> {
        let key = delivery_key_for(arxiv_id, recipient)?;
        let mut released = false;
        Self::cas_update::<DeliveryRecord, _>(&self.deliveries, "delivery", &key, |cur| {
            released = false;
            match cur {
                Some(record) if record.status == DeliveryStatus::Pending => {
                    released = true;
                    Ok(None)
                }
                other => Ok(other),
            }
        })?;
        Ok(released)
    }

    pub fn is_delivered(&self, arxiv_id: &str, recipient: &Recipient) -> Result<bool, StoreError> {
        let key = delivery_key_for(arxiv_id, recipient)?;
        match self.deliveries.get(key.as_bytes())? {
            Some(raw) => {
                let record: DeliveryRecord = Self::deserialize(&raw)?;
                Ok(record.status == DeliveryStatus::Delivered)
            }
            None => Ok(false),
        }
    }

    pub fn get_delivery(
        &self,
        arxiv_id: &str,
        recipient: &Recipient,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let key = delivery_key_for(arxiv_id, recipient)?;
        match self.deliveries.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn recipients_for_paper(&self, arxiv_id: &str) -> Result<Vec<Recipient>, StoreError> {
        let prefix = keys::delivery_prefix(arxiv_id)?;
        let mut recipients = Vec::new();
        for item in self.deliveries.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            let record: DeliveryRecord = Self::deserialize(&raw)?;
            if record.status == DeliveryStatus::Delivered {
                recipients.push(record.recipient);
            }
        }
        Ok(recipients)
    }

    /// Newest delivery first.
    pub fn deliveries_for_recipient(
        &self,
        recipient: &Recipient,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let prefix =
            keys::recipient_delivery_prefix(recipient.platform.as_str(), &recipient.chat_id)?;
        let mut records = Vec::new();
        for item in self.deliveries_by_recipient.scan_prefix(prefix.as_bytes()) {
            if records.len() >= limit {
                break;
            }
            let (_, id) = item?;
            let arxiv_id = String::from_utf8_lossy(&id).to_string();
            if let Some(record) = self.get_delivery(&arxiv_id, recipient)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Removes pending claims taken before `older_than`. Returns how many were dropped.
    pub fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut released = 0;
        for item in self.deliveries.iter() {
            let (key, raw) = item?;
            let record: DeliveryRecord = match Self::deserialize(&raw) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable ledger row");
                    continue;
                }
            };
            if record.status != DeliveryStatus::Pending || record.claimed_at >= older_than {
                continue;
            }
            // lost race means the row changed under us; leave it
            if self
                .deliveries
                .compare_and_swap(&key, Some(&raw), None::<&[u8]>)?
                .is_ok()
            {
                released += 1;
            }
        }
        Ok(released)
    }

    pub(crate) fn purge_deliveries_for_recipient(
        &self,
        recipient: &Recipient,
    ) -> Result<usize, StoreError> {
        let mut purged = 0;
        for item in self.deliveries.iter() {
            let (key, raw) = item?;
            let Ok(record) = Self::deserialize::<DeliveryRecord>(&raw) else {
                continue;
            };
            if &record.recipient == recipient {
                self.deliveries.remove(&key)?;
                purged += 1;
            }
        }

        let prefix =
            keys::recipient_delivery_prefix(recipient.platform.as_str(), &recipient.chat_id)?;
        for item in self.deliveries_by_recipient.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            self.deliveries_by_recipient.remove(&key)?;
        }
        Ok(purged)
    }

    pub fn count_deliveries(&self) -> usize {
        self.deliveries.len()
    }
}
