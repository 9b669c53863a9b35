//! Rendering of papers into chat messages.

use pulldown_cmark::{html, Event, Parser};

use crate::constants::{AR5IV_BASE_URL, TELEGRAM_MESSAGE_LIMIT};
use crate::store::operations::papers::Paper;
use crate::store::operations::subscribers::DeliveryPreferences;

const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

const ELLIPSIS: char = '…';

const MAX_TITLE_CHARS: usize = 300;
const MAX_AUTHORS_CHARS: usize = 500;
const MAX_COMMENT_CHARS: usize = 300;
const MAX_CATEGORIES_CHARS: usize = 200;
const MAX_TAGS_CHARS: usize = 300;

/// 转义 Telegram MarkdownV2 的所有特殊字符。
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inside `(...)` of an inline link only `)` and `\` must be escaped.
fn escape_markdown_v2_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for c in url.chars() {
        if c == ')' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inside inline code only `` ` `` and `\` must be escaped.
pub fn escape_markdown_v2_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_commonmark(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '*' | '_' | '[' | ']' | '`' | '<' | '>' | '#') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn ar5iv_link(arxiv_id: &str) -> String {
    format!("{AR5IV_BASE_URL}/{arxiv_id}")
}

fn published_date(paper: &Paper) -> String {
    paper.published.format("%Y-%m-%d").to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push(ELLIPSIS);
    out
}

/// Optional text sections, after preferences are applied.
struct Sections<'a> {
    translation: Option<&'a str>,
    tags: Option<String>,
    description: Option<&'a str>,
}

fn sections<'a>(paper: &'a Paper, prefs: &DeliveryPreferences) -> Sections<'a> {
    Sections {
        translation: paper
            .translation
            .as_deref()
            .filter(|t| prefs.show_translation && !t.is_empty()),
        tags: (prefs.show_tags && !paper.tags.is_empty()).then(|| paper.tags.join(", ")),
        description: paper
            .description
            .as_deref()
            .filter(|d| prefs.show_summary && !d.is_empty()),
    }
}

/// Raw (unescaped) text of one Telegram message.
struct TelegramParts {
    title: String,
    authors: String,
    comment: Option<String>,
    categories: String,
    translation: Option<String>,
    tags: Option<String>,
    description: Option<String>,
}

impl TelegramParts {
    fn new(paper: &Paper, prefs: &DeliveryPreferences) -> Self {
        let s = sections(paper, prefs);
        Self {
            title: truncate_chars(&paper.title, MAX_TITLE_CHARS),
            authors: truncate_chars(&paper.authors.join(", "), MAX_AUTHORS_CHARS),
            comment: paper
                .comment
                .as_deref()
                .filter(|c| !c.is_empty())
                .map(|c| truncate_chars(c, MAX_COMMENT_CHARS)),
            categories: truncate_chars(&paper.categories.join(", "), MAX_CATEGORIES_CHARS),
            translation: s.translation.map(str::to_string),
            tags: s.tags.map(|t| truncate_chars(&t, MAX_TAGS_CHARS)),
            description: s.description.map(str::to_string),
        }
    }

    /// Drops the optional text in order of least value. `false` once nothing is left to drop.
    fn shrink(&mut self, overflow: usize) -> bool {
        // escaping can double a character, so shrink by the full overflow each round
        for field in [&mut self.translation, &mut self.description] {
            if let Some(text) = field.take() {
                let keep = text.chars().count().saturating_sub(overflow + 1);
                if keep > 0 {
                    *field = Some(truncate_chars(&text, keep));
                }
                return true;
            }
        }
        if self.comment.take().is_some() || self.tags.take().is_some() {
            return true;
        }
        let title = truncate_chars(&self.title, MAX_TITLE_CHARS / 3);
        let authors = truncate_chars(&self.authors, MAX_AUTHORS_CHARS / 5);
        if title == self.title && authors == self.authors {
            return false;
        }
        self.title = title;
        self.authors = authors;
        true
    }

    fn render(&self, paper: &Paper, published: &str) -> String {
        let mut lines = vec![
            format!("*{}*", escape_markdown_v2(&self.title)),
            format!("Au: {}", escape_markdown_v2(&self.authors)),
            format!("Pu: *{}*", escape_markdown_v2(published)),
            String::new(),
        ];
        if let Some(t) = &self.translation {
            lines.push(format!("Translation: {}", escape_markdown_v2(t)));
        }
        if let Some(t) = &self.tags {
            lines.push(format!("Tags: {}", escape_markdown_v2(t)));
        }
        if let Some(d) = &self.description {
            lines.push(format!("Summary: *{}*", escape_markdown_v2(d)));
        }
        if self.translation.is_some() || self.tags.is_some() || self.description.is_some() {
            lines.push(String::new());
        }
        if let Some(c) = &self.comment {
            lines.push(escape_markdown_v2(&format!("Comment: {c}")));
        }
        lines.push(escape_markdown_v2(&format!("Categories: {}", self.categories)));
        lines.push(format!(
            "Continue: [Links]({}) \\| [PDF]({}) \\| [Ar5iv]({})",
            escape_markdown_v2_url(&paper.link),
            escape_markdown_v2_url(&paper.pdf_link),
            escape_markdown_v2_url(&ar5iv_link(&paper.arxiv_id)),
        ));
        lines.join("\n")
    }
}

/// MarkdownV2 body for Telegram, at most 4096 characters.
///
/// Raw text is shortened before escaping, so entities and escapes are never cut.
/// Translation goes first, then the description, comment and tags.
pub fn telegram_message(paper: &Paper, prefs: &DeliveryPreferences) -> String {
    let mut parts = TelegramParts::new(paper, prefs);
    let published = published_date(paper);
    loop {
        let rendered = parts.render(paper, &published);
        let len = rendered.chars().count();
        if len <= TELEGRAM_MESSAGE_LIMIT || !parts.shrink(len - TELEGRAM_MESSAGE_LIMIT) {
            return rendered;
        }
    }
}

/// CommonMark body, used as the plain `body` of Matrix messages.
pub fn markdown_message(paper: &Paper, prefs: &DeliveryPreferences) -> String {
    let s = sections(paper, prefs);
    let mut lines = vec![
        format!("**{}**", escape_commonmark(&paper.title)),
        format!("Authors: {}", escape_commonmark(&paper.authors.join(", "))),
        format!("Published: **{}**", published_date(paper)),
    ];
    if let Some(t) = s.translation {
        lines.push(format!("Translation: {}", escape_commonmark(t)));
    }
    if let Some(t) = s.tags.as_deref() {
        lines.push(format!("Tags: {}", escape_commonmark(t)));
    }
    if let Some(d) = s.description {
        lines.push(format!("Summary: **{}**", escape_commonmark(d)));
    }
    if let Some(c) = paper.comment.as_deref().filter(|c| !c.is_empty()) {
        lines.push(format!("Comment: {}", escape_commonmark(c)));
    }
    lines.push(format!("Categories: {}", paper.categories.join(", ")));
    lines.push(format!(
        "Continue: [Links]({}) | [PDF]({}) | [Ar5iv]({})",
        paper.link,
        paper.pdf_link,
        ar5iv_link(&paper.arxiv_id)
    ));
    lines.join("\n")
}

/// Renders CommonMark to HTML, keeping single newlines as line breaks.
pub fn html_message(markdown: &str) -> String {
    let parser = Parser::new(markdown).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        other => other,
    });
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out.trim_end().to_string()
}
