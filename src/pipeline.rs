//! Poll → match → enrich → deliver.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::constants::MAX_SINCE_DAYS;
use crate::services::arxiv::{ArxivError, PaperIndex};
use crate::services::enrichment::PaperEnricher;
use crate::services::transport::Transports;
use crate::store::operations::deliveries::ClaimOutcome;
use crate::store::operations::papers::Paper;
use crate::store::operations::subscribers::{Recipient, SearchQuery, Subscriber};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("paper index failed: {0}")]
    Index(#[from] ArxivError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("subscriber not found: {0}")]
    SubscriberNotFound(Recipient),
    #[error("paper not found: {0}")]
    PaperNotFound(String),
    #[error("enrichment is disabled")]
    EnrichmentDisabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub sent: usize,
    /// Already delivered, claimed by another run, or older than `since_days`.
    pub skipped: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deliveries: DeliveryReport,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_interval_hours: u32,
    pub default_categories: Vec<String>,
    /// Per-query result cap, also used for category polling.
    pub max_results: u32,
    pub stale_claim: Duration,
}

pub struct PollPipeline {
    store: Arc<Store>,
    index: Arc<dyn PaperIndex>,
    enricher: Option<Arc<PaperEnricher>>,
    transports: Transports,
    settings: PipelineSettings,
}

impl PollPipeline {
    pub fn new(
        store: Arc<Store>,
        index: Arc<dyn PaperIndex>,
        enricher: Option<Arc<PaperEnricher>>,
        transports: Transports,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            index,
            enricher,
            transports,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Searches the index and returns the matches in index order. Known papers
    /// come back with their stored enrichment; new ones are enriched and stored.
    pub async fn collect(&self, query: &str, max_results: u32) -> Result<Vec<Paper>, PipelineError> {
        let found = self.index.search(query, max_results).await?;
        self.absorb(found).await
    }

    async fn absorb(&self, found: Vec<Paper>) -> Result<Vec<Paper>, PipelineError> {
        let mut papers = Vec::with_capacity(found.len());
        let mut fresh_positions = Vec::new();
        let mut fresh = Vec::new();

        for paper in found {
            match self.store.get_paper(&paper.arxiv_id)? {
                Some(stored) => papers.push(stored),
                None => {
                    fresh_positions.push(papers.len());
                    papers.push(paper.clone());
                    fresh.push(paper);
                }
            }
        }

        if fresh.is_empty() {
            return Ok(papers);
        }

        if let Some(enricher) = &self.enricher {
            let enrichments = enricher.enrich_batch(&fresh).await;
            for (paper, enrichment) in fresh.iter_mut().zip(enrichments) {
                paper.apply_enrichment(enrichment);
            }
        }

        for (position, paper) in fresh_positions.into_iter().zip(fresh) {
            if self.store.insert_paper_if_absent(&paper)? {
                tracing::info!(arxiv_id = %paper.arxiv_id, "Stored new paper");
                papers[position] = paper;
            } else if let Some(stored) = self.store.get_paper(&paper.arxiv_id)? {
                // stored concurrently by another run; theirs wins
                papers[position] = stored;
            }
        }

        Ok(papers)
    }

    /// Sends every paper the recipient has not received yet.
    pub async fn deliver(&self, subscriber: &Subscriber, papers: &[Paper]) -> DeliveryReport {
        let recipient = &subscriber.recipient;
        let mut report = DeliveryReport::default();
        let cutoff = since_cutoff(Utc::now(), subscriber.since_days);

        let Some(transport) = self.transports.get(recipient.platform) else {
            tracing::warn!(recipient = %recipient, "No transport for platform");
            report.failed = papers.iter().filter(|p| p.published >= cutoff).count();
            report.skipped = papers.len() - report.failed;
            return report;
        };

        for paper in papers {
            if paper.published < cutoff {
                report.skipped += 1;
                continue;
            }

            let claim = self.store.claim_delivery(
                &paper.arxiv_id,
                recipient,
                Utc::now(),
                self.settings.stale_claim,
            );
            match claim {
                Ok(ClaimOutcome::Claimed) => {}
                Ok(ClaimOutcome::AlreadyDelivered) | Ok(ClaimOutcome::InFlight) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(recipient = %recipient, arxiv_id = %paper.arxiv_id, error = %e, "Failed to claim delivery");
                    report.failed += 1;
                    continue;
                }
            }

            match transport
                .send_paper(&recipient.chat_id, paper, &subscriber.preferences)
                .await
            {
                Ok(()) => {
                    report.sent += 1;
                    if let Err(e) = self.store.confirm_delivery(&paper.arxiv_id, recipient, Utc::now()) {
                        tracing::error!(recipient = %recipient, arxiv_id = %paper.arxiv_id, error = %e, "Sent but failed to confirm delivery");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(recipient = %recipient, arxiv_id = %paper.arxiv_id, error = %e, "Send failed, releasing claim");
                    if let Err(e) = self.store.release_delivery(&paper.arxiv_id, recipient) {
                        tracing::error!(recipient = %recipient, arxiv_id = %paper.arxiv_id, error = %e, "Failed to release claim");
                    }
                }
            }
        }

        report
    }

    /// `collect` + `deliver` for a single saved query.
    pub async fn run_query(
        &self,
        subscriber: &Subscriber,
        query: &SearchQuery,
    ) -> Result<DeliveryReport, PipelineError> {
        let papers = self.collect(&query.query, query.max_results).await?;
        Ok(self.deliver(subscriber, &papers).await)
    }

    /// Runs every saved query, or today's papers in the default categories when
    /// the subscriber has none. `last_check` is stamped unless every query failed.
    pub async fn run_for_subscriber(&self, subscriber: &Subscriber) -> Result<DeliveryReport, PipelineError> {
        let recipient = &subscriber.recipient;
        let mut report = DeliveryReport::default();

        if subscriber.search_queries.is_empty() {
            if !self.settings.default_categories.is_empty() {
                let today = Utc::now().date_naive();
                let found = self
                    .index
                    .fetch_today_new(&self.settings.default_categories, self.settings.max_results, today)
                    .await;
                let papers = self.absorb(found).await?;
                report.merge(self.deliver(subscriber, &papers).await);
            }
        } else {
            let mut last_error = None;
            let mut succeeded = 0usize;
            for query in &subscriber.search_queries {
                match self.run_query(subscriber, query).await {
                    Ok(r) => {
                        succeeded += 1;
                        report.merge(r);
                    }
                    Err(e) => {
                        tracing::error!(recipient = %recipient, query = %query.query, error = %e, "Query failed");
                        last_error = Some(e);
                    }
                }
            }
            if succeeded == 0 {
                if let Some(e) = last_error {
                    return Err(e);
                }
            }
        }

        self.store.touch_last_check(recipient, Utc::now())?;
        tracing::info!(
            recipient = %recipient,
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            "Subscriber poll finished"
        );
        Ok(report)
    }

    /// Polls every due subscriber. One subscriber failing never stops the others.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<PollSummary, PipelineError> {
        let subscribers = self.store.list_subscribers()?;
        let mut summary = PollSummary::default();

        for subscriber in subscribers {
            if self.transports.get(subscriber.recipient.platform).is_none() {
                tracing::debug!(recipient = %subscriber.recipient, "Platform disabled, skipping subscriber");
                continue;
            }
            let schedule = subscriber.effective_schedule(self.settings.default_interval_hours);
            if !schedule.is_due(subscriber.last_check, now) {
                continue;
            }

            summary.due += 1;
            match self.run_for_subscriber(&subscriber).await {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.deliveries.merge(report);
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(recipient = %subscriber.recipient, error = %e, "Subscriber poll failed");
                }
            }
        }

        Ok(summary)
    }

    /// Runs enrichment again for a stored paper and saves whatever came back.
    pub async fn reenrich(&self, arxiv_id: &str) -> Result<Paper, PipelineError> {
        let enricher = self
            .enricher
            .as_ref()
            .ok_or(PipelineError::EnrichmentDisabled)?;
        let paper = self
            .store
            .get_paper(arxiv_id)?
            .ok_or_else(|| PipelineError::PaperNotFound(arxiv_id.to_string()))?;

        let enrichment = enricher.enrich(&paper).await;
        if enrichment.is_empty() {
            tracing::warn!(arxiv_id, "Re-enrichment produced nothing, keeping stored fields");
            return Ok(paper);
        }
        let updated = self.store.update_paper_enrichment(arxiv_id, &enrichment)?;
        tracing::info!(arxiv_id, tags = updated.tags.len(), "Paper re-enriched");
        Ok(updated)
    }

    /// Manual run, regardless of schedule.
    pub async fn fetch_now(&self, recipient: &Recipient) -> Result<DeliveryReport, PipelineError> {
        let subscriber = self
            .store
            .get_subscriber(recipient)?
            .ok_or_else(|| PipelineError::SubscriberNotFound(recipient.clone()))?;
        self.run_for_subscriber(&subscriber).await
    }
}

/// Oldest `published` still delivered. Out-of-range windows fall back to the earliest instant.
fn since_cutoff(now: DateTime<Utc>, since_days: u32) -> DateTime<Utc> {
    let days = i64::from(since_days.min(MAX_SINCE_DAYS));
    now.checked_sub_signed(Duration::days(days))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
