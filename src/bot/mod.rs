//! Telegram 命令处理：长轮询 getUpdates，分发命令与对话流程。

pub mod commands;
pub mod flow;
pub mod session;

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, OnceCell};

use crate::constants::EXAMPLE_QUERY;
use crate::pipeline::PollPipeline;
use crate::schedule::Schedule;
use crate::services::format::{escape_markdown_v2, escape_markdown_v2_code};
use crate::services::telegram::{Message, ParseMode, TelegramClient, Update};
use crate::services::transport::TransportError;
use crate::store::operations::subscribers::{Recipient, SearchQuery, Subscriber};
use crate::store::{Store, StoreError};

use self::commands::{parse_command, parse_prefs_args, Command, PrefField};
use self::session::{Session, SessionManager};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub(crate) const LOAD_FAILED: &str = "无法加载您的配置。请稍后重试。";
const SESSION_EXPIRED: &str = "⚠️ 操作超时，已自动取消。";
const PREFS_USAGE: &str = "用法：/prefs tags|translation|summary on|off";
const SCHEDULE_USAGE: &str = "用法：/schedule 6h 或 /schedule daily 08:00（UTC）";

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub fetch_interval_hours: u32,
    pub max_results_cap: u32,
}

pub struct TelegramBot {
    client: TelegramClient,
    store: Arc<Store>,
    pipeline: Arc<PollPipeline>,
    sessions: SessionManager,
    settings: BotSettings,
    username: OnceCell<String>,
}

impl TelegramBot {
    pub fn new(
        client: TelegramClient,
        store: Arc<Store>,
        pipeline: Arc<PollPipeline>,
        sessions: SessionManager,
        settings: BotSettings,
    ) -> Self {
        Self {
            client,
            store,
            pipeline,
            sessions,
            settings,
            username: OnceCell::new(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Long-polls until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        match self.client.get_me().await {
            Ok(me) => {
                if let Some(name) = me.username {
                    tracing::info!(username = %name, "Telegram bot connected");
                    let _ = self.username.set(name);
                }
            }
            Err(e) => tracing::warn!(error = %e, "getMe failed, accepting any @suffix"),
        }

        let mut offset: Option<i64> = None;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let result = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = self.client.get_updates(offset, self.client.poll_timeout_secs()) => result,
            };

            match result {
                Ok(updates) => {
                    backoff = INITIAL_BACKOFF;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        self.handle_update(update).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "getUpdates failed");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        tracing::info!("Telegram bot stopped");
    }

    pub async fn handle_update(self: &Arc<Self>, update: Update) {
        if let Some(callback) = update.callback_query {
            if let Err(e) = self.on_callback(callback).await {
                tracing::error!(error = %e, "Failed to handle callback query");
            }
            return;
        }

        let Some(message) = update.message else {
            return;
        };
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let chat_id = message.chat.id;

        let result = match parse_command(text, self.username.get().map(String::as_str)) {
            Some(command) => self.dispatch(chat_id, command).await,
            // unknown command, or one addressed to another bot
            None if text.trim_start().starts_with('/') => Ok(()),
            None => self.on_text(chat_id, text).await,
        };
        if let Err(e) = result {
            tracing::error!(chat_id, error = %e, "Failed to handle message");
        }
    }

    async fn dispatch(self: &Arc<Self>, chat_id: i64, command: Command) -> Result<(), BotError> {
        tracing::debug!(chat_id, ?command, "Command received");
        match command {
            Command::Start | Command::Help => self.cmd_start(chat_id).await,
            Command::Show => self.cmd_show(chat_id).await,
            Command::SetKeywords => self.start_set_keywords(chat_id).await,
            Command::Cancel => self.cmd_cancel(chat_id).await,
            Command::Prefs(args) => self.cmd_prefs(chat_id, &args).await,
            Command::Schedule(args) => self.cmd_schedule(chat_id, &args).await,
            Command::FetchNow => {
                // 抓取可能持续数分钟，不阻塞轮询循环
                let bot = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = bot.fetch_now(chat_id).await {
                        tracing::error!(chat_id, error = %e, "fetch_now failed");
                    }
                });
                Ok(())
            }
        }
    }

    pub(crate) async fn reply(&self, chat_id: i64, text: &str) -> Result<Message, BotError> {
        Ok(self
            .client
            .send_message(&chat_id.to_string(), text, None, None)
            .await?)
    }

    pub(crate) async fn reply_markdown(&self, chat_id: i64, text: &str) -> Result<Message, BotError> {
        Ok(self
            .client
            .send_message(&chat_id.to_string(), text, Some(ParseMode::MarkdownV2), None)
            .await?)
    }

    /// Deletes the bot prompts of a finished conversation. Failures are ignored.
    pub(crate) async fn revoke(&self, session: &Session) {
        let chat_id = session.chat_id.to_string();
        for message_id in &session.prompt_messages {
            if let Err(e) = self.client.delete_message(&chat_id, *message_id).await {
                tracing::debug!(chat_id = session.chat_id, message_id, error = %e, "Failed to revoke prompt");
            }
        }
    }

    /// Ends idle conversations: revokes their prompts and tells the user.
    pub async fn expire_sessions(&self, now: Instant) -> usize {
        let expired = self.sessions.take_expired(now).await;
        for session in &expired {
            tracing::info!(chat_id = session.chat_id, "Session timed out");
            self.revoke(session).await;
            if let Err(e) = self.reply(session.chat_id, SESSION_EXPIRED).await {
                tracing::debug!(chat_id = session.chat_id, error = %e, "Failed to send timeout notice");
            }
        }
        expired.len()
    }

    async fn cmd_start(&self, chat_id: i64) -> Result<(), BotError> {
        self.reply_markdown(chat_id, &welcome_text(self.settings.fetch_interval_hours))
            .await?;
        Ok(())
    }

    async fn cmd_show(&self, chat_id: i64) -> Result<(), BotError> {
        let recipient = Recipient::telegram(chat_id);
        let subscriber = match self.store.get_subscriber(&recipient) {
            Ok(s) => s.unwrap_or_else(|| Subscriber::new(recipient)),
            Err(e) => {
                tracing::error!(chat_id, error = %e, "Failed to load subscriber");
                self.reply(chat_id, LOAD_FAILED).await?;
                return Ok(());
            }
        };
        let text = show_text(&subscriber, self.settings.fetch_interval_hours);
        self.reply_markdown(chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_cancel(&self, chat_id: i64) -> Result<(), BotError> {
        match self.sessions.end(chat_id).await {
            Some(session) => {
                self.revoke(&session).await;
                self.reply(chat_id, "操作已取消。").await?;
            }
            None => {
                self.reply(chat_id, "当前没有进行中的操作。").await?;
            }
        }
        Ok(())
    }

    async fn cmd_prefs(&self, chat_id: i64, args: &str) -> Result<(), BotError> {
        let recipient = Recipient::telegram(chat_id);

        if args.is_empty() {
            let prefs = self
                .store
                .get_subscriber(&recipient)?
                .map(|s| s.preferences)
                .unwrap_or_default();
            let text = format!(
                "当前推送偏好：\n标签 (tags)：{}\n翻译 (translation)：{}\n摘要 (summary)：{}\n\n{PREFS_USAGE}",
                on_off(prefs.show_tags),
                on_off(prefs.show_translation),
                on_off(prefs.show_summary),
            );
            self.reply(chat_id, &text).await?;
            return Ok(());
        }

        let Some((field, value)) = parse_prefs_args(args) else {
            self.reply(chat_id, PREFS_USAGE).await?;
            return Ok(());
        };

        self.store.update_subscriber(&recipient, |sub| match field {
            PrefField::Tags => sub.preferences.show_tags = value,
            PrefField::Translation => sub.preferences.show_translation = value,
            PrefField::Summary => sub.preferences.show_summary = value,
        })?;
        tracing::info!(chat_id, field = field.as_str(), value, "Preferences updated");
        self.reply(
            chat_id,
            &format!("✅ 已更新：{} = {}", field.as_str(), if value { "on" } else { "off" }),
        )
        .await?;
        Ok(())
    }

    async fn cmd_schedule(&self, chat_id: i64, args: &str) -> Result<(), BotError> {
        let recipient = Recipient::telegram(chat_id);
        let default_hours = self.settings.fetch_interval_hours;

        if args.is_empty() {
            let schedule = self
                .store
                .get_subscriber(&recipient)?
                .map(|s| s.effective_schedule(default_hours))
                .unwrap_or(Schedule::Interval {
                    hours: default_hours,
                });
            self.reply(chat_id, &format!("当前推送计划：{schedule}\n{SCHEDULE_USAGE}"))
                .await?;
            return Ok(());
        }

        let schedule = match Schedule::from_str(args) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(chat_id, error = %e, "Invalid schedule");
                self.reply(chat_id, SCHEDULE_USAGE).await?;
                return Ok(());
            }
        };

        let sub = self
            .store
            .update_subscriber(&recipient, |sub| sub.schedule = Some(schedule))?;
        let next = schedule.next_due(sub.last_check, Utc::now());
        tracing::info!(chat_id, %schedule, "Schedule updated");
        self.reply(
            chat_id,
            &format!(
                "✅ 推送计划已设置为 {schedule}，下次推送：{} UTC",
                next.format("%Y-%m-%d %H:%M")
            ),
        )
        .await?;
        Ok(())
    }

    /// Runs every saved query now, with a progress message per query.
    pub async fn fetch_now(&self, chat_id: i64) -> Result<(), BotError> {
        let recipient = Recipient::telegram(chat_id);
        let subscriber = match self.store.get_subscriber(&recipient) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(chat_id, error = %e, "Failed to load subscriber");
                self.reply(chat_id, LOAD_FAILED).await?;
                return Ok(());
            }
        };
        let Some(subscriber) = subscriber.filter(|s| !s.search_queries.is_empty()) else {
            self.reply(chat_id, "您没有设置检索式，请设置检索式。").await?;
            return Ok(());
        };

        let mut listing = vec![escape_markdown_v2("您一共有以下检索式：")];
        for q in &subscriber.search_queries {
            listing.push(format!(
                "\\- `{}` {}",
                escape_markdown_v2_code(&q.query),
                escape_markdown_v2(&format!("最大结果: {}", q.max_results))
            ));
        }
        self.reply_markdown(chat_id, &listing.join("\n")).await?;

        let mut any_succeeded = false;
        for query in &subscriber.search_queries {
            self.reply_markdown(
                chat_id,
                &format!(
                    "正在根据检索式 `{}` 获取最新论文",
                    escape_markdown_v2_code(&query.query)
                ),
            )
            .await?;

            match self.pipeline.run_query(&subscriber, query).await {
                Ok(report) if report.failed == 0 => {
                    any_succeeded = true;
                    self.reply(chat_id, "该检索式的论文已全部发送。").await?;
                }
                Ok(report) => {
                    any_succeeded = true;
                    self.reply(
                        chat_id,
                        &format!("有 {} 篇论文发送失败，将在下次推送时重试。", report.failed),
                    )
                    .await?;
                }
                Err(e) => {
                    tracing::warn!(chat_id, query = %query.query, error = %e, "Manual fetch failed");
                    self.reply(chat_id, "检索失败，请检查检索式或稍后重试。").await?;
                }
            }
        }

        if any_succeeded {
            self.store.touch_last_check(&recipient, Utc::now())?;
        }
        Ok(())
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "开"
    } else {
        "关"
    }
}

pub(crate) fn query_lines(queries: &[SearchQuery]) -> String {
    queries
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. {} (最大结果: {})\n", i + 1, q.query, q.max_results))
        .collect()
}

fn welcome_text(interval_hours: u32) -> String {
    let intro = format!(
        "您好！我是您的 Arxiv 机器人。\n\n本机器人会定期为您推送最新的 Arxiv 论文。\n\
         您只需要设定检索式，便可以开始接收推送。当前管理员设定的抓取间隔为 {interval_hours} 小时。\n\n\
         我将通过 API 获取检索论文并使用 AI 为您生成标签和摘要。\n\n"
    );
    let note = "请注意，检索式请尽量使用 all 字段进行组合查询，title 字段可能获取不到预期的结果。";
    let example = "\n\n我将按照发布时间降序推送。以下是检索式例子：\n\n";
    let commands = "\n\n常用命令：/set_keywords /show /fetch_now /prefs /schedule /cancel";
    format!(
        "{}*{}*{}`{}`{}",
        escape_markdown_v2(&intro),
        escape_markdown_v2(note),
        escape_markdown_v2(example),
        escape_markdown_v2_code(EXAMPLE_QUERY),
        escape_markdown_v2(commands),
    )
}

fn show_text(subscriber: &Subscriber, default_hours: u32) -> String {
    let mut out = escape_markdown_v2(&format!(
        "当前管理员设定的抓取间隔为 {default_hours} 小时。\n\n"
    ));

    if subscriber.search_queries.is_empty() {
        out.push_str(&escape_markdown_v2(
            "您还没有设置任何检索式。使用 /set_keywords 来添加检索式。",
        ));
    } else {
        out.push_str("📋 您当前的检索式：\n\n");
        for (i, q) in subscriber.search_queries.iter().enumerate() {
            out.push_str(&format!(
                "{} `{}` {}\n",
                escape_markdown_v2(&format!("{}.", i + 1)),
                escape_markdown_v2_code(&q.query),
                escape_markdown_v2(&format!("(最大结果: {})", q.max_results)),
            ));
        }
    }

    let schedule = subscriber.effective_schedule(default_hours);
    let next = schedule.next_due(subscriber.last_check, Utc::now());
    out.push_str(&escape_markdown_v2(&format!(
        "\n\n推送计划：{schedule}\n下次推送：{} UTC",
        next.format("%Y-%m-%d %H:%M")
    )));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_mentions_interval_and_example() {
        let text = welcome_text(6);
        assert!(text.contains("抓取间隔为 6 小时"));
        assert!(text.contains("`cat:cs.CV AND all:\"object detection\"`"));
        assert!(text.contains("/set\\_keywords"));
    }

    #[test]
    fn show_lists_queries_with_max_results() {
        let mut sub = Subscriber::new(Recipient::telegram(1));
        sub.search_queries = vec![SearchQuery {
            query: "cat:cs.CL".to_string(),
            max_results: 5,
        }];
        let text = show_text(&sub, 6);
        assert!(text.contains("📋 您当前的检索式："));
        assert!(text.contains("1\\. `cat:cs.CL` \\(最大结果: 5\\)"));
        assert!(text.contains("推送计划：6h"));
    }

    #[test]
    fn show_without_queries_points_to_set_keywords() {
        let sub = Subscriber::new(Recipient::telegram(1));
        let text = show_text(&sub, 3);
        assert!(text.contains("您还没有设置任何检索式"));
        assert!(text.contains("抓取间隔为 3 小时"));
    }

    #[test]
    fn query_lines_are_numbered_from_one() {
        let lines = query_lines(&[
            SearchQuery {
                query: "a".to_string(),
                max_results: 1,
            },
            SearchQuery {
                query: "b".to_string(),
                max_results: 2,
            },
        ]);
        assert_eq!(lines, "1. a (最大结果: 1)\n2. b (最大结果: 2)\n");
    }
}
