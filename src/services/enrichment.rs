use futures::stream::{self, StreamExt};

use crate::services::llm_provider::{ChatMessage, LlmError, LlmProvider};
use crate::store::operations::papers::{Enrichment, Paper};

const SYSTEM_PROMPT: &str = "你是一个学术论文分析助手。";

/// AI 标签、中文总结与一句话描述。
#[derive(Debug, Clone)]
pub struct PaperEnricher {
    llm: LlmProvider,
    max_tags: usize,
    concurrency: usize,
}

impl PaperEnricher {
    pub fn new(llm: LlmProvider, max_tags: usize, concurrency: usize) -> Self {
        Self {
            llm,
            max_tags: max_tags.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub async fn generate_tags(&self, title: &str, abstract_text: &str) -> Result<Vec<String>, LlmError> {
        let prompt = format!(
            "请根据以下论文标题和摘要生成不超过{}个标签，简短且用中文，以逗号分隔输出。标题：{}\n摘要：{}",
            self.max_tags, title, abstract_text
        );
        let raw = self
            .llm
            .chat(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)])
            .await?;
        Ok(parse_tags(&raw, self.max_tags))
    }

    pub async fn translate_summary(&self, title: &str, abstract_text: &str) -> Result<String, LlmError> {
        let prompt = format!(
            "请将以下论文标题和摘要总结为中文，3-5句话，保持学术风格, 纯文本，仅输出总结内容。\n标题：{}\n摘要：{}",
            title, abstract_text
        );
        let text = self
            .llm
            .chat(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)])
            .await?;
        Ok(text.trim().to_string())
    }

    pub async fn describe(&self, title: &str, abstract_text: &str) -> Result<String, LlmError> {
        let prompt = format!(
            "Write a one-sentence English TL;DR of this paper. Output only the sentence.\nTitle: {}\nAbstract: {}",
            title, abstract_text
        );
        let text = self
            .llm
            .chat(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)])
            .await?;
        Ok(text.trim().to_string())
    }

    /// Each field is generated independently; a failure leaves only that field empty.
    pub async fn enrich(&self, paper: &Paper) -> Enrichment {
        let (tags, translation, description) = futures::join!(
            self.generate_tags(&paper.title, &paper.summary),
            self.translate_summary(&paper.title, &paper.summary),
            self.describe(&paper.title, &paper.summary),
        );

        Enrichment {
            tags: keep_or_log(tags, "tags", &paper.arxiv_id).unwrap_or_default(),
            translation: keep_or_log(translation, "translation", &paper.arxiv_id)
                .filter(|s| !s.is_empty()),
            description: keep_or_log(description, "description", &paper.arxiv_id)
                .filter(|s| !s.is_empty()),
        }
    }

    /// Results are returned in input order.
    pub async fn enrich_batch(&self, papers: &[Paper]) -> Vec<Enrichment> {
        let pending: Vec<_> = papers.iter().map(|paper| self.enrich(paper)).collect();
        stream::iter(pending)
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

fn keep_or_log<T>(result: Result<T, LlmError>, field: &'static str, arxiv_id: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(LlmError::Disabled) => None,
        Err(e) => {
            tracing::warn!(arxiv_id, field, error = %e, "Enrichment failed");
            None
        }
    }
}

/// Splits on `,` `，` `、` and newlines, trims, drops empties.
pub fn parse_tags(raw: &str, max_tags: usize) -> Vec<String> {
    raw.split([',', '，', '\n', '、'])
        .map(|t| t.trim().trim_matches(|c| c == '#' || c == '"'))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .take(max_tags)
        .map(str::to_string)
        .collect()
}
