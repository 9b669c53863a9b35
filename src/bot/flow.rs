//! `/set_keywords` 多步对话：新增或删除检索式。

use crate::constants::EXAMPLE_QUERY;
use crate::services::telegram::{CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup};
use crate::store::operations::subscribers::Recipient;
use crate::store::StoreError;

use super::session::FlowState;
use super::{query_lines, BotError, TelegramBot, LOAD_FAILED};

pub const CALLBACK_ADD: &str = "add_query";
pub const CALLBACK_DELETE: &str = "delete_query";
pub const CALLBACK_CANCEL: &str = "cancel";

fn action_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: vec![vec![
            InlineKeyboardButton::new("➕ 新增", CALLBACK_ADD),
            InlineKeyboardButton::new("🗑 删除", CALLBACK_DELETE),
            InlineKeyboardButton::new("❌ 取消", CALLBACK_CANCEL),
        ]],
    }
}

impl TelegramBot {
    pub(crate) async fn start_set_keywords(&self, chat_id: i64) -> Result<(), BotError> {
        let recipient = Recipient::telegram(chat_id);
        let queries = match self.store.get_subscriber(&recipient) {
            Ok(sub) => sub.map(|s| s.search_queries).unwrap_or_default(),
            Err(e) => {
                tracing::error!(chat_id, error = %e, "Failed to load subscriber");
                self.reply(chat_id, LOAD_FAILED).await?;
                return Ok(());
            }
        };

        let (state, prompt) = if queries.is_empty() {
            let msg = self
                .reply(chat_id, "您还没有设置任何检索式，请输入要添加的检索式：")
                .await?;
            (FlowState::AddingQuery, msg)
        } else {
            let text = format!("📋 当前检索式：\n\n{}\n请选择操作：", query_lines(&queries));
            let msg = self
                .client
                .send_message(&chat_id.to_string(), &text, None, Some(&action_keyboard()))
                .await?;
            (FlowState::ChoosingAction, msg)
        };

        if let Some(previous) = self
            .sessions
            .begin(chat_id, state, Some(prompt.message_id))
            .await
        {
            self.revoke(&previous).await;
        }
        Ok(())
    }

    pub(crate) async fn on_callback(&self, callback: CallbackQuery) -> Result<(), BotError> {
        if let Err(e) = self.client.answer_callback_query(&callback.id, None).await {
            tracing::debug!(error = %e, "answerCallbackQuery failed");
        }

        let Some(message) = callback.message else {
            return Ok(());
        };
        let chat_id = message.chat.id;
        let message_id = message.message_id;
        let chat = chat_id.to_string();

        // 会话已超时或已结束的按钮直接忽略
        if self.sessions.touch(chat_id).await.is_none() {
            return Ok(());
        }

        match callback.data.as_deref() {
            Some(CALLBACK_CANCEL) => {
                self.client
                    .edit_message_text(&chat, message_id, "操作已取消。", None)
                    .await?;
                if let Some(session) = self.sessions.end(chat_id).await {
                    self.revoke(&session).await;
                }
            }
            Some(CALLBACK_ADD) => {
                self.client
                    .edit_message_text(
                        &chat,
                        message_id,
                        &format!("请输入新的检索式：\n例如：{EXAMPLE_QUERY}"),
                        None,
                    )
                    .await?;
                self.sessions
                    .update(chat_id, |s| {
                        s.state = FlowState::AddingQuery;
                        s.track_prompt(message_id);
                    })
                    .await;
            }
            Some(CALLBACK_DELETE) => {
                let queries = self
                    .store
                    .get_subscriber(&Recipient::telegram(chat_id))?
                    .map(|s| s.search_queries)
                    .unwrap_or_default();
                if queries.is_empty() {
                    self.client
                        .edit_message_text(&chat, message_id, "您还没有设置检索式。", None)
                        .await?;
                    self.sessions.end(chat_id).await;
                    return Ok(());
                }
                let text = format!("请输入要删除的编号：\n{}", query_lines(&queries));
                self.client
                    .edit_message_text(&chat, message_id, &text, None)
                    .await?;
                self.sessions
                    .update(chat_id, |s| {
                        s.state = FlowState::DeletingQuery;
                        s.track_prompt(message_id);
                    })
                    .await;
            }
            other => {
                tracing::debug!(chat_id, data = ?other, "Unknown callback data");
            }
        }
        Ok(())
    }

    /// Free text is only meaningful inside a conversation; otherwise ignored.
    pub(crate) async fn on_text(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
        let Some(session) = self.sessions.touch(chat_id).await else {
            return Ok(());
        };
        let text = text.trim();
        let cap = self.settings.max_results_cap;
        let recipient = Recipient::telegram(chat_id);

        match session.state {
            FlowState::ChoosingAction => {}
            FlowState::AddingQuery => {
                if text.is_empty() {
                    self.reply(chat_id, "检索式不能为空，请重新输入：").await?;
                    return Ok(());
                }
                let prompt = self
                    .reply(
                        chat_id,
                        &format!("检索式: {text}\n请输入最大结果数 (1-{cap})："),
                    )
                    .await?;
                let query = text.to_string();
                self.sessions
                    .update(chat_id, |s| {
                        s.state = FlowState::AddingMaxResults;
                        s.pending_query = Some(query);
                        s.track_prompt(prompt.message_id);
                    })
                    .await;
            }
            FlowState::AddingMaxResults => {
                let Ok(max_results) = text.parse::<u32>() else {
                    self.reply(chat_id, "请输入有效的数字。").await?;
                    return Ok(());
                };
                if !(1..=cap).contains(&max_results) {
                    self.reply(chat_id, &format!("请输入1-{cap}之间的数字。"))
                        .await?;
                    return Ok(());
                }
                let Some(query) = session.pending_query else {
                    self.sessions
                        .update(chat_id, |s| s.state = FlowState::AddingQuery)
                        .await;
                    self.reply(chat_id, "请输入新的检索式：").await?;
                    return Ok(());
                };

                match self
                    .store
                    .add_search_query(&recipient, &query, max_results, cap)
                {
                    Ok(_) => {
                        tracing::info!(chat_id, query = %query, max_results, "Search query added");
                        self.reply(
                            chat_id,
                            &format!("✅ 添加成功：{query}（最大结果 {max_results}）"),
                        )
                        .await?;
                        self.finish(chat_id).await;
                    }
                    Err(StoreError::Conflict { .. }) => {
                        self.reply(chat_id, "该检索式已存在，请重新输入。").await?;
                        self.sessions
                            .update(chat_id, |s| {
                                s.state = FlowState::AddingQuery;
                                s.pending_query = None;
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(chat_id, error = %e, "Failed to add search query");
                        self.reply(chat_id, LOAD_FAILED).await?;
                        self.finish(chat_id).await;
                    }
                }
            }
            FlowState::DeletingQuery => {
                let Ok(index) = text.parse::<usize>() else {
                    self.reply(chat_id, "请输入数字编号。").await?;
                    return Ok(());
                };
                match self.store.remove_search_query(&recipient, index) {
                    Ok(removed) => {
                        tracing::info!(chat_id, query = %removed.query, "Search query removed");
                        self.reply(chat_id, &format!("🗑 已删除：{}", removed.query))
                            .await?;
                        self.finish(chat_id).await;
                    }
                    Err(StoreError::NotFound { .. }) => {
                        self.reply(chat_id, "编号无效。").await?;
                    }
                    Err(e) => {
                        tracing::error!(chat_id, error = %e, "Failed to remove search query");
                        self.reply(chat_id, LOAD_FAILED).await?;
                        self.finish(chat_id).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn finish(&self, chat_id: i64) {
        if let Some(session) = self.sessions.end(chat_id).await {
            self.revoke(&session).await;
        }
    }
}
