use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_SINCE_DAYS;
use crate::schedule::Schedule;
use crate::store::keys;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Matrix,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Matrix => "matrix",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Ok(Platform::Telegram),
            "matrix" => Ok(Platform::Matrix),
            other => Err(StoreError::Validation(format!("unknown platform '{other}'"))),
        }
    }
}

/// A chat that can receive papers: Telegram chat id or Matrix room id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub platform: Platform,
    pub chat_id: String,
}

impl Recipient {
    pub fn new(platform: Platform, chat_id: impl Into<String>) -> Self {
        Self {
            platform,
            chat_id: chat_id.into(),
        }
    }

    pub fn telegram(chat_id: i64) -> Self {
        Self::new(Platform::Telegram, chat_id.to_string())
    }

    pub fn key(&self) -> Result<String, StoreError> {
        keys::subscriber_key(self.platform.as_str(), &self.chat_id)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.chat_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub query: String,
    pub max_results: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPreferences {
    pub show_tags: bool,
    pub show_translation: bool,
    pub show_summary: bool,
}

impl Default for DeliveryPreferences {
    fn default() -> Self {
        Self {
            show_tags: true,
            show_translation: true,
            show_summary: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub recipient: Recipient,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub search_queries: Vec<SearchQuery>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub preferences: DeliveryPreferences,
    pub since_days: u32,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn new(recipient: Recipient) -> Self {
        let now = Utc::now();
        Self {
            recipient,
            description: None,
            search_queries: Vec::new(),
            schedule: None,
            preferences: DeliveryPreferences::default(),
            since_days: DEFAULT_SINCE_DAYS,
            last_check: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Explicit schedule, or the global poll interval.
    pub fn effective_schedule(&self, default_interval_hours: u32) -> Schedule {
        self.schedule.unwrap_or(Schedule::Interval {
            hours: default_interval_hours,
        })
    }
}

pub fn validate_search_query(query: &str, max_results: u32, cap: u32) -> Result<(), StoreError> {
    if query.trim().is_empty() {
        return Err(StoreError::Validation("query must not be empty".to_string()));
    }
    if max_results == 0 || max_results > cap {
        return Err(StoreError::Validation(format!(
            "max_results must be between 1 and {cap}"
        )));
    }
    Ok(())
}

impl Store {
    pub fn get_subscriber(&self, recipient: &Recipient) -> Result<Option<Subscriber>, StoreError> {
        let key = recipient.key()?;
        match self.subscribers.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        let key = subscriber.recipient.key()?;
        self.subscribers
            .insert(key.as_bytes(), Self::serialize(subscriber)?)?;
        Ok(())
    }

    /// Removes the subscriber together with its ledger rows.
    pub fn delete_subscriber(&self, recipient: &Recipient) -> Result<bool, StoreError> {
        let key = recipient.key()?;
        let existed = self.subscribers.remove(key.as_bytes())?.is_some();
        let purged = self.purge_deliveries_for_recipient(recipient)?;
        if purged > 0 {
            tracing::info!(recipient = %recipient, purged, "Purged ledger rows for removed subscriber");
        }
        Ok(existed)
    }

    pub fn list_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let mut subscribers = Vec::new();
        for item in self.subscribers.iter() {
            let (_, raw) = item?;
            subscribers.push(Self::deserialize::<Subscriber>(&raw)?);
        }
        Ok(subscribers)
    }

    pub fn list_subscribers_by_platform(
        &self,
        platform: Platform,
    ) -> Result<Vec<Subscriber>, StoreError> {
        let prefix = format!("{}:", platform.as_str());
        let mut subscribers = Vec::new();
        for item in self.subscribers.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            subscribers.push(Self::deserialize::<Subscriber>(&raw)?);
        }
        Ok(subscribers)
    }

    /// Appends a query, creating the subscriber when missing. Returns the updated list.
    pub fn add_search_query(
        &self,
        recipient: &Recipient,
        query: &str,
        max_results: u32,
        cap: u32,
    ) -> Result<Vec<SearchQuery>, StoreError> {
        validate_search_query(query, max_results, cap)?;
        let query = query.trim().to_string();
        let key = recipient.key()?;

        let updated = Self::cas_update::<Subscriber, _>(&self.subscribers, "subscriber", &key, |cur| {
            let mut sub = cur.unwrap_or_else(|| Subscriber::new(recipient.clone()));
            if sub.search_queries.iter().any(|q| q.query == query) {
                return Err(StoreError::Conflict {
                    entity: "search_query".to_string(),
                    key: query.clone(),
                });
            }
            sub.search_queries.push(SearchQuery {
                query: query.clone(),
                max_results,
            });
            sub.updated_at = Utc::now();
            Ok(Some(sub))
        })?;

        Ok(updated.map(|s| s.search_queries).unwrap_or_default())
    }

    /// `index` is 1-based, as shown to users.
    pub fn remove_search_query(
        &self,
        recipient: &Recipient,
        index: usize,
    ) -> Result<SearchQuery, StoreError> {
        let key = recipient.key()?;
        let mut removed = None;

        Self::cas_update::<Subscriber, _>(&self.subscribers, "subscriber", &key, |cur| {
            let mut sub = cur.ok_or_else(|| StoreError::NotFound {
                entity: "subscriber".to_string(),
                key: recipient.to_string(),
            })?;
            if index == 0 || index > sub.search_queries.len() {
                return Err(StoreError::NotFound {
                    entity: "search_query".to_string(),
                    key: index.to_string(),
                });
            }
            removed = Some(sub.search_queries.remove(index - 1));
            sub.updated_at = Utc::now();
            Ok(Some(sub))
        })?;

        removed.ok_or_else(|| StoreError::NotFound {
            entity: "search_query".to_string(),
            key: index.to_string(),
        })
    }

    pub fn touch_last_check(
        &self,
        recipient: &Recipient,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = recipient.key()?;
        Self::cas_update::<Subscriber, _>(&self.subscribers, "subscriber", &key, |cur| {
            let Some(mut sub) = cur else {
                return Ok(None);
            };
            sub.last_check = Some(at);
            Ok(Some(sub))
        })?;
        Ok(())
    }

    /// Read-modify-write of an existing subscriber.
    pub fn update_subscriber<F>(
        &self,
        recipient: &Recipient,
        mut update: F,
    ) -> Result<Subscriber, StoreError>
    where
        F: FnMut(&mut Subscriber),
    {
        let key = recipient.key()?;
        let updated = Self::cas_update::<Subscriber, _>(&self.subscribers, "subscriber", &key, |cur| {
            let mut sub = cur.unwrap_or_else(|| Subscriber::new(recipient.clone()));
            update(&mut sub);
            sub.updated_at = Utc::now();
            Ok(Some(sub))
        })?;
        updated.ok_or_else(|| StoreError::NotFound {
            entity: "subscriber".to_string(),
            key: recipient.to_string(),
        })
    }
}
