use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::ArxivConfig;
use crate::store::operations::papers::Paper;

const DEFAULT_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ArxivError {
    #[error("arxiv request timed out")]
    Timeout,
    #[error("arxiv network error: {0}")]
    Network(String),
    #[error("arxiv returned HTTP {status}")]
    Http { status: u16 },
    #[error("arxiv feed could not be parsed: {0}")]
    Parse(String),
    #[error("arxiv rejected the query: {0}")]
    Query(String),
}

impl ArxivError {
    fn is_transient(&self) -> bool {
        match self {
            ArxivError::Timeout | ArxivError::Network(_) => true,
            ArxivError::Http { status } => *status >= 500 || *status == 429,
            ArxivError::Parse(_) | ArxivError::Query(_) => false,
        }
    }
}

/// Read side of the paper index.
#[async_trait]
pub trait PaperIndex: Send + Sync {
    /// Newest submissions first.
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<Paper>, ArxivError>;

    async fn fetch_recent(&self, category: &str, max_results: u32) -> Result<Vec<Paper>, ArxivError> {
        self.search(&format!("cat:{category}"), max_results).await
    }

    /// Papers from `categories` published on `today` (UTC). A failing category is skipped.
    async fn fetch_today_new(
        &self,
        categories: &[String],
        max_results: u32,
        today: NaiveDate,
    ) -> Vec<Paper> {
        let mut papers = Vec::new();
        for category in categories {
            tracing::info!(category = %category, "Fetching new papers");
            match self.fetch_recent(category, max_results).await {
                Ok(found) => papers.extend(
                    found
                        .into_iter()
                        .filter(|p| p.published.date_naive() == today),
                ),
                Err(e) => {
                    tracing::error!(category = %category, error = %e, "Failed to fetch recent papers");
                }
            }
        }
        papers
    }
}

/// Client for the arXiv Atom export API.
pub struct ArxivClient {
    http: reqwest::Client,
    api_url: String,
    request_interval: Duration,
    retries: usize,
    last_request: Mutex<Option<Instant>>,
}

impl ArxivClient {
    pub fn new(config: &ArxivConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("arxiv-notifier/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            api_url: config.api_url.clone(),
            request_interval: Duration::from_millis(config.request_interval_ms),
            retries: DEFAULT_RETRIES,
            last_request: Mutex::new(None),
        }
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Keeps successive API calls at least `request_interval` apart.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.request_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn request_once(&self, query: &str, max_results: u32) -> Result<String, ArxivError> {
        self.throttle().await;
        let max = max_results.to_string();
        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("search_query", query),
                ("start", "0"),
                ("max_results", max.as_str()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ArxivError::Timeout
                } else {
                    ArxivError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ArxivError::Http {
                status: status.as_u16(),
            });
        }
        response
            .text()
            .await
            .map_err(|e| ArxivError::Network(e.to_string()))
    }
}

#[async_trait]
impl PaperIndex for ArxivClient {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<Paper>, ArxivError> {
        tracing::info!(query, max_results, "Searching arXiv");
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.retries);

        let body = RetryIf::start(
            strategy,
            || self.request_once(query, max_results),
            |e: &ArxivError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(query, error = %e, "arXiv request failed, retrying");
                }
                retry
            },
        )
        .await?;

        let papers = parse_feed(&body, Utc::now())?;
        tracing::debug!(query, count = papers.len(), "arXiv search finished");
        Ok(papers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Title,
    Summary,
    Published,
    Updated,
    AuthorName,
    Comment,
}

#[derive(Default)]
struct EntryBuilder {
    id_url: String,
    title: String,
    summary: String,
    published: String,
    updated: String,
    authors: Vec<String>,
    comment: String,
    categories: Vec<String>,
    primary_category: Option<String>,
    link: Option<String>,
    pdf_link: Option<String>,
}

impl EntryBuilder {
    fn field_mut(&mut self, field: Field) -> &mut String {
        match field {
            Field::Id => &mut self.id_url,
            Field::Title => &mut self.title,
            Field::Summary => &mut self.summary,
            Field::Published => &mut self.published,
            Field::Updated => &mut self.updated,
            Field::Comment => &mut self.comment,
            Field::AuthorName => {
                if self.authors.is_empty() {
                    self.authors.push(String::new());
                }
                // the author vector always has a trailing slot while a <name> is open
                let last = self.authors.len() - 1;
                &mut self.authors[last]
            }
        }
    }

    fn build(self, fetched_at: DateTime<Utc>) -> Result<Paper, ArxivError> {
        let id_url = self.id_url.trim().to_string();
        // old-style ids keep their archive prefix (`hep-th/9901001v1`)
        let arxiv_id = id_url
            .split_once("/abs/")
            .map(|(_, id)| id)
            .or_else(|| id_url.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ArxivError::Parse(format!("entry without id: '{id_url}'")))?
            .to_string();
        let published = parse_timestamp(&self.published)?;
        let updated = if self.updated.trim().is_empty() {
            published
        } else {
            parse_timestamp(&self.updated)?
        };
        let link = self.link.unwrap_or_else(|| id_url.clone());
        let pdf_link = self
            .pdf_link
            .unwrap_or_else(|| link.replacen("/abs/", "/pdf/", 1));
        let comment = normalize_whitespace(&self.comment);

        Ok(Paper {
            arxiv_id,
            title: normalize_whitespace(&self.title),
            authors: self
                .authors
                .iter()
                .map(|a| normalize_whitespace(a))
                .filter(|a| !a.is_empty())
                .collect(),
            summary: normalize_whitespace(&self.summary),
            published,
            updated,
            categories: self.categories,
            primary_category: self.primary_category,
            link,
            pdf_link,
            comment: (!comment.is_empty()).then_some(comment),
            tags: Vec::new(),
            description: None,
            translation: None,
            added_at: fetched_at,
        })
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ArxivError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ArxivError::Parse(format!("bad timestamp '{}': {e}", raw.trim())))
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, ArxivError> {
    match e
        .try_get_attribute(name)
        .map_err(|err| ArxivError::Parse(err.to_string()))?
    {
        Some(a) => Ok(Some(
            a.unescape_value()
                .map_err(|err| ArxivError::Parse(err.to_string()))?
                .into_owned(),
        )),
        None => Ok(None),
    }
}

fn apply_empty_element(entry: &mut EntryBuilder, e: &BytesStart<'_>) -> Result<(), ArxivError> {
    match e.local_name().as_ref() {
        b"link" => {
            let href = attr(e, "href")?;
            let rel = attr(e, "rel")?;
            let title = attr(e, "title")?;
            if title.as_deref() == Some("pdf") {
                entry.pdf_link = href;
            } else if rel.as_deref() == Some("alternate") {
                entry.link = href;
            }
        }
        b"category" => {
            if let Some(term) = attr(e, "term")? {
                entry.categories.push(term);
            }
        }
        b"primary_category" => {
            entry.primary_category = attr(e, "term")?;
        }
        _ => {}
    }
    Ok(())
}

/// Parses an arXiv Atom feed. An error feed (entry id under `/api/errors`) becomes `ArxivError::Query`.
pub fn parse_feed(xml: &str, fetched_at: DateTime<Utc>) -> Result<Vec<Paper>, ArxivError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut papers = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    let mut field: Option<Field> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ArxivError::Parse(e.to_string()))?;
        match event {
            Event::Start(e) => {
                let name = e.local_name();
                if name.as_ref() == b"entry" {
                    entry = Some(EntryBuilder::default());
                    continue;
                }
                let Some(current) = entry.as_mut() else {
                    continue;
                };
                field = match name.as_ref() {
                    b"id" => Some(Field::Id),
                    b"title" => Some(Field::Title),
                    b"summary" => Some(Field::Summary),
                    b"published" => Some(Field::Published),
                    b"updated" => Some(Field::Updated),
                    b"comment" => Some(Field::Comment),
                    b"name" => {
                        current.authors.push(String::new());
                        Some(Field::AuthorName)
                    }
                    _ => {
                        apply_empty_element(current, &e)?;
                        None
                    }
                };
            }
            Event::Empty(e) => {
                if let Some(current) = entry.as_mut() {
                    apply_empty_element(current, &e)?;
                }
            }
            Event::Text(t) => {
                if let (Some(current), Some(f)) = (entry.as_mut(), field) {
                    let text = t.unescape().map_err(|e| ArxivError::Parse(e.to_string()))?;
                    let slot = current.field_mut(f);
                    if !slot.is_empty() {
                        slot.push(' ');
                    }
                    slot.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let (Some(current), Some(f)) = (entry.as_mut(), field) {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    current.field_mut(f).push_str(&text);
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"entry" {
                    if let Some(done) = entry.take() {
                        if done.id_url.contains("/api/errors") {
                            let message = normalize_whitespace(&done.summary);
                            return Err(ArxivError::Query(message));
                        }
                        papers.push(done.build(fetched_at)?);
                    }
                }
                field = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(papers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <id>https://arxiv.org/api/abc</id>
  <title>arXiv Query: search_query=cat:cs.CV</title>
  <entry>
    <id>http://arxiv.org/abs/2401.01234v2</id>
    <updated>2024-01-03T10:00:00Z</updated>
    <published>2024-01-02T18:30:00Z</published>
    <title>Detecting   Objects
      with Transformers</title>
    <summary>  We propose a new
      detector &amp; evaluate it.  </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name><arxiv:affiliation>Bletchley</arxiv:affiliation></author>
    <arxiv:comment>12 pages, 4 figures</arxiv:comment>
    <link href="http://arxiv.org/abs/2401.01234v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2401.01234v2" rel="related" type="application/pdf"/>
    <arxiv:primary_category term="cs.CV" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.CV" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/hep-th/9901001v1</id>
    <updated>1999-01-01T00:00:00Z</updated>
    <published>1999-01-01T00:00:00Z</published>
    <title>Old Style</title>
    <summary>Legacy identifier.</summary>
    <author><name>Someone</name></author>
    <category term="hep-th" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

    const ERROR_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>http://arxiv.org/api/errors#incorrect_id_format_for_1234</id>
    <title>Error</title>
    <summary>incorrect id format for 1234</summary>
    <updated>2024-01-01T00:00:00-05:00</updated>
  </entry>
</feed>"#;

    #[test]
    fn parses_entries() {
        let papers = parse_feed(SAMPLE_FEED, Utc::now()).unwrap();
        assert_eq!(papers.len(), 2);

        let p = &papers[0];
        assert_eq!(p.arxiv_id, "2401.01234v2");
        assert_eq!(p.title, "Detecting Objects with Transformers");
        assert_eq!(p.summary, "We propose a new detector & evaluate it.");
        assert_eq!(p.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(p.categories, vec!["cs.CV", "cs.LG"]);
        assert_eq!(p.primary_category.as_deref(), Some("cs.CV"));
        assert_eq!(p.comment.as_deref(), Some("12 pages, 4 figures"));
        assert_eq!(p.pdf_link, "http://arxiv.org/pdf/2401.01234v2");
        assert_eq!(p.published.to_rfc3339(), "2024-01-02T18:30:00+00:00");
        assert!(p.tags.is_empty());
    }

    #[test]
    fn missing_links_are_derived_from_id() {
        let papers = parse_feed(SAMPLE_FEED, Utc::now()).unwrap();
        let old = &papers[1];
        assert_eq!(old.arxiv_id, "hep-th/9901001v1");
        assert_eq!(old.link, "http://arxiv.org/abs/hep-th/9901001v1");
        assert_eq!(old.pdf_link, "http://arxiv.org/pdf/hep-th/9901001v1");
        assert!(old.comment.is_none());
    }

    #[test]
    fn error_feed_is_a_query_error() {
        let err = parse_feed(ERROR_FEED, Utc::now()).unwrap_err();
        match err {
            ArxivError::Query(msg) => assert!(msg.contains("incorrect id format")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_feed_yields_nothing() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>empty</title></feed>"#;
        assert!(parse_feed(xml, Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn bad_timestamp_is_parse_error() {
        let xml = r#"<feed><entry><id>http://arxiv.org/abs/1v1</id><published>yesterday</published></entry></feed>"#;
        assert!(matches!(
            parse_feed(xml, Utc::now()),
            Err(ArxivError::Parse(_))
        ));
    }

    #[test]
    fn transient_errors() {
        assert!(ArxivError::Timeout.is_transient());
        assert!(ArxivError::Http { status: 503 }.is_transient());
        assert!(!ArxivError::Http { status: 400 }.is_transient());
        assert!(!ArxivError::Query("x".into()).is_transient());
    }
}
