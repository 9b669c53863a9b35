use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// 多步对话所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// 已展示检索式列表和操作按钮
    ChoosingAction,
    AddingQuery,
    AddingMaxResults,
    DeletingQuery,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub chat_id: i64,
    pub state: FlowState,
    /// 等待输入最大结果数的检索式
    pub pending_query: Option<String>,
    /// 会话结束时需要撤回的 bot 提示消息
    pub prompt_messages: Vec<i64>,
    last_active: Instant,
}

impl Session {
    fn new(chat_id: i64, state: FlowState) -> Self {
        Self {
            chat_id,
            state,
            pending_query: None,
            prompt_messages: Vec::new(),
            last_active: Instant::now(),
        }
    }

    pub fn track_prompt(&mut self, message_id: i64) {
        if !self.prompt_messages.contains(&message_id) {
            self.prompt_messages.push(message_id);
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }
}

/// One conversation per chat, expired after a period of inactivity.
#[derive(Debug)]
pub struct SessionManager {
    sessions: Mutex<HashMap<i64, Session>>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts a fresh conversation, replacing any previous one for the chat.
    /// The replaced session is returned so its prompts can be revoked.
    pub async fn begin(&self, chat_id: i64, state: FlowState, prompt: Option<i64>) -> Option<Session> {
        let mut session = Session::new(chat_id, state);
        if let Some(id) = prompt {
            session.track_prompt(id);
        }
        tracing::debug!(chat_id, ?state, "Session started");
        self.sessions.lock().await.insert(chat_id, session)
    }

    /// Current session snapshot, refreshing its activity time.
    pub async fn touch(&self, chat_id: i64) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&chat_id)?;
        session.last_active = Instant::now();
        Some(session.clone())
    }

    /// Applies `f` to the chat's session. Returns `false` when there is none.
    pub async fn update<F>(&self, chat_id: i64, f: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&chat_id) {
            Some(session) => {
                f(session);
                session.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn end(&self, chat_id: i64) -> Option<Session> {
        let removed = self.sessions.lock().await.remove(&chat_id);
        if removed.is_some() {
            tracing::debug!(chat_id, "Session ended");
        }
        removed
    }

    /// Removes and returns every session idle for longer than the timeout.
    pub async fn take_expired(&self, now: Instant) -> Vec<Session> {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<i64> = sessions
            .iter()
            .filter(|(_, s)| s.idle_for(now) > self.timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
