use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use arxiv_notifier::services::arxiv::{ArxivError, PaperIndex};
use arxiv_notifier::services::transport::{ChatTransport, TransportError};
use arxiv_notifier::store::operations::papers::Paper;
use arxiv_notifier::store::operations::subscribers::{DeliveryPreferences, Platform};

pub fn paper(arxiv_id: &str, published: DateTime<Utc>) -> Paper {
    Paper {
        arxiv_id: arxiv_id.to_string(),
        title: format!("Paper {arxiv_id}"),
        authors: vec!["Grace Hopper".to_string()],
        summary: "A study of sparse attention for detection.".to_string(),
        published,
        updated: published,
        categories: vec!["cs.CV".to_string()],
        primary_category: Some("cs.CV".to_string()),
        link: format!("http://arxiv.org/abs/{arxiv_id}"),
        pdf_link: format!("http://arxiv.org/pdf/{arxiv_id}"),
        comment: None,
        tags: Vec::new(),
        description: None,
        translation: None,
        added_at: Utc::now(),
    }
}

/// Published an hour ago, inside every `since_days` window.
pub fn fresh_paper(arxiv_id: &str) -> Paper {
    paper(arxiv_id, Utc::now() - Duration::hours(1))
}

/// In-memory index: query string → canned results.
#[derive(Default)]
pub struct FakeIndex {
    results: Mutex<HashMap<String, Vec<Paper>>>,
    failing: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, query: &str, papers: Vec<Paper>) {
        self.results
            .lock()
            .unwrap()
            .insert(query.to_string(), papers);
    }

    pub fn fail(&self, query: &str) {
        self.failing.lock().unwrap().push(query.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaperIndex for FakeIndex {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<Paper>, ArxivError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().iter().any(|q| q == query) {
            return Err(ArxivError::Http { status: 503 });
        }
        let mut papers = self
            .results
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_default();
        papers.truncate(max_results as usize);
        Ok(papers)
    }
}

/// Records every paper it is asked to send.
pub struct RecordingTransport {
    platform: Platform,
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(chat_id, arxiv_id)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn send_paper(
        &self,
        chat_id: &str,
        paper: &Paper,
        _prefs: &DeliveryPreferences,
    ) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Network("connection reset".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), paper.arxiv_id.clone()));
        Ok(())
    }
}
