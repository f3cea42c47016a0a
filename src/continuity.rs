use anyhow::Result;
use std::sync::Arc;

use crate::chat::{ConversationLog, Dispatch};
use crate::config::ConfigStore;
use crate::content::ContentEngine;

/// At most one autonomous continuation per silence window.
const CONTINUATION_CAP: u32 = 1;
/// Idle tick count at which the engine pivots to a new topic.
const NEW_TOPIC_THRESHOLD: u32 = 3;
/// Idle tick count at which the engine enters sleep mode.
const SLEEP_THRESHOLD: u32 = 6;

/// Counter-driven conversational-continuity engine. Counters live in the
/// shared store; this engine and successful comment dispatch are their only
/// writers.
pub struct ContinuityEngine {
    store: ConfigStore,
    content: Arc<dyn ContentEngine>,
    log: Arc<dyn ConversationLog>,
    dispatch: Arc<dyn Dispatch>,
}

impl ContinuityEngine {
    pub fn new(
        store: ConfigStore,
        content: Arc<dyn ContentEngine>,
        log: Arc<dyn ConversationLog>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            store,
            content,
            log,
            dispatch,
        }
    }

    /// First step of every tick: decide whether the previous reply should be
    /// continued before anything else happens. Returns whether a continuation
    /// was dispatched.
    pub async fn continue_if_needed(&self) -> Result<bool> {
        let config = self.store.config().await;
        let sleep_mode = self.store.sleep_mode().await;
        let continuation_count = self.store.continuation_count().await;

        if sleep_mode || continuation_count >= CONTINUATION_CAP || !config.continuity_mode {
            if continuation_count != 0 {
                self.store.set_continuation_count(0).await;
            }
            return Ok(false);
        }

        let history = self.log.messages();
        if !self.content.is_continuation_needed(&history).await? {
            if continuation_count != 0 {
                self.store.set_continuation_count(0).await;
            }
            return Ok(false);
        }

        let messages = self
            .content
            .continuation_prompt(&config.system_prompt, &history)
            .await?;
        if let Err(error) = self.dispatch.dispatch_prompt(messages).await {
            tracing::warn!("Failed to dispatch continuation: {}", error);
        }

        self.store
            .set_continuation_count(continuation_count + 1)
            .await;
        // Keep a follow-up silent tick from re-entering the count-0 branches.
        if self.store.no_comment_count().await < 1 {
            self.store.set_no_comment_count(1).await;
        }

        Ok(true)
    }

    /// A tick found no fresh comments. Advance the idle counter and escalate:
    /// continuation prompts, then a topic change, then sleep.
    pub async fn handle_idle_tick(&self) -> Result<()> {
        let config = self.store.config().await;
        let count = self.store.no_comment_count().await + 1;

        if config.continuity_mode {
            let history = self.log.messages();

            if count < NEW_TOPIC_THRESHOLD
                || (NEW_TOPIC_THRESHOLD < count && count < SLEEP_THRESHOLD)
            {
                let messages = self
                    .content
                    .continuation_prompt(&config.system_prompt, &history)
                    .await?;
                if let Err(error) = self.dispatch.dispatch_prompt(messages).await {
                    tracing::warn!("Failed to dispatch continuation: {}", error);
                }
            } else if count == NEW_TOPIC_THRESHOLD {
                let topic = self.content.new_topic(&history).await?;
                tracing::info!("Changing topic to: {}", topic);
                let messages = self
                    .content
                    .new_topic_prompt(&config.system_prompt, &history, &topic)
                    .await?;
                if let Err(error) = self.dispatch.dispatch_prompt(messages).await {
                    tracing::warn!("Failed to dispatch topic change: {}", error);
                }
            } else if count == SLEEP_THRESHOLD {
                let messages = self
                    .content
                    .sleep_prompt(&config.system_prompt, &history)
                    .await?;
                if let Err(error) = self.dispatch.dispatch_prompt(messages).await {
                    tracing::warn!("Failed to dispatch sleep message: {}", error);
                }
                self.store.set_sleep_mode(true).await;
            }
        }

        tracing::debug!("Idle tick count: {}", count);
        self.store.set_no_comment_count(count).await;
        Ok(())
    }

    /// A real comment batch was processed; silence counters reset regardless
    /// of continuity mode.
    pub async fn note_comment_activity(&self) {
        self.store.set_no_comment_count(0).await;
        self.store.set_sleep_mode(false).await;
    }
}
