use std::time::Instant;

use crate::bot::TelegramBot;

pub async fn run(bot: &TelegramBot) {
    let expired = bot.expire_sessions(Instant::now()).await;
    if expired > 0 {
        tracing::info!(expired, "session_sweep: done");
    }
}
