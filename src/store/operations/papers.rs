use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::keys;
use crate::store::{Store, StoreError};

/// A paper as returned by the index, plus the AI enrichment shared by all recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paper {
    pub arxiv_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub summary: String,
    pub published: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub categories: Vec<String>,
    #[serde(default)]
    pub primary_category: Option<String>,
    pub link: String,
    pub pdf_link: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub translation: Option<String>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub translation: Option<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.description.is_none() && self.translation.is_none()
    }
}

impl Paper {
    pub fn apply_enrichment(&mut self, enrichment: Enrichment) {
        if !enrichment.tags.is_empty() {
            self.tags = enrichment.tags;
        }
        if enrichment.description.is_some() {
            self.description = enrichment.description;
        }
        if enrichment.translation.is_some() {
            self.translation = enrichment.translation;
        }
    }

    pub fn is_enriched(&self) -> bool {
        !self.tags.is_empty() || self.description.is_some() || self.translation.is_some()
    }
}

impl Store {
    /// Insert guarded by a unique key. Returns `false` when the paper is already stored.
    pub fn insert_paper_if_absent(&self, paper: &Paper) -> Result<bool, StoreError> {
        let key = keys::paper_key(&paper.arxiv_id)?;
        let bytes = Self::serialize(paper)?;

        let cas_result = self
            .papers
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(bytes))
            .map_err(StoreError::Sled)?;
        if cas_result.is_err() {
            return Ok(false);
        }

        let index_key =
            keys::paper_added_index_key(paper.added_at.timestamp_millis(), &paper.arxiv_id)?;
        if let Err(e) = self
            .papers_by_added
            .insert(index_key.as_bytes(), paper.arxiv_id.as_bytes())
        {
            let _ = self.papers.remove(key.as_bytes());
            return Err(StoreError::Sled(e));
        }

        Ok(true)
    }

    pub fn get_paper(&self, arxiv_id: &str) -> Result<Option<Paper>, StoreError> {
        let key = keys::paper_key(arxiv_id)?;
        match self.papers.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn paper_exists(&self, arxiv_id: &str) -> Result<bool, StoreError> {
        let key = keys::paper_key(arxiv_id)?;
        Ok(self.papers.contains_key(key.as_bytes())?)
    }

    pub fn delete_paper(&self, arxiv_id: &str) -> Result<bool, StoreError> {
        let key = keys::paper_key(arxiv_id)?;
        let Some(raw) = self.papers.remove(key.as_bytes())? else {
            return Ok(false);
        };

        match Self::deserialize::<Paper>(&raw) {
            Ok(paper) => {
                let index_key = keys::paper_added_index_key(
                    paper.added_at.timestamp_millis(),
                    &paper.arxiv_id,
                )?;
                self.papers_by_added.remove(index_key.as_bytes())?;
            }
            Err(e) => {
                tracing::warn!(arxiv_id, error = %e, "Deleted paper had unreadable payload; index entry left behind");
            }
        }
        Ok(true)
    }

    pub fn recent_papers(&self, limit: usize) -> Result<Vec<Paper>, StoreError> {
        let mut papers = Vec::new();
        for item in self.papers_by_added.iter() {
            if papers.len() >= limit {
                break;
            }
            let (_, id) = item?;
            let arxiv_id = String::from_utf8_lossy(&id).to_string();
            if let Some(paper) = self.get_paper(&arxiv_id)? {
                papers.push(paper);
            }
        }
        Ok(papers)
    }

    /// Case-insensitive substring match on title or abstract, newest publication first.
    pub fn search_papers(&self, keyword: &str, limit: usize) -> Result<Vec<Paper>, StoreError> {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return Err(StoreError::Validation("keyword must not be empty".to_string()));
        }

        let mut matches = Vec::new();
        for item in self.papers.iter() {
            let (_, raw) = match item {
                Ok(kv) => kv,
                Err(_) => continue,
            };
            let Ok(paper) = Self::deserialize::<Paper>(&raw) else {
                continue;
            };
            if paper.title.to_lowercase().contains(&needle)
                || paper.summary.to_lowercase().contains(&needle)
            {
                matches.push(paper);
            }
        }

        matches.sort_by(|a, b| b.published.cmp(&a.published));
        matches.truncate(limit);
        Ok(matches)
    }

    pub fn update_paper_enrichment(
        &self,
        arxiv_id: &str,
        enrichment: &Enrichment,
    ) -> Result<Paper, StoreError> {
        let key = keys::paper_key(arxiv_id)?;
        let updated = Self::cas_update::<Paper, _>(&self.papers, "paper", &key, |current| {
            let mut paper = current.ok_or_else(|| StoreError::NotFound {
                entity: "paper".to_string(),
                key: arxiv_id.to_string(),
            })?;
            paper.apply_enrichment(enrichment.clone());
            Ok(Some(paper))
        })?;

        updated.ok_or_else(|| StoreError::NotFound {
            entity: "paper".to_string(),
            key: arxiv_id.to_string(),
        })
    }

    pub fn count_papers(&self) -> usize {
        self.papers.len()
    }
}
