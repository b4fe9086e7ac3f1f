use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;

/// Delivery channel for settlement outcomes. Kept behind a trait so the
/// engine can be exercised without a live bot.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: i64, text: &str) -> Result<()>;
}

pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(token: &str) -> Self {
        Self { bot: Bot::new(token) }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, user_id: i64, text: &str) -> Result<()> {
        self.bot.send_message(ChatId(user_id), text.to_string()).await?;
        Ok(())
    }
}

/// Used when no bot token is configured; outcomes still reach the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: i64, text: &str) -> Result<()> {
        tracing::info!(user_id, "outcome notification: {}", text);
        Ok(())
    }
}
