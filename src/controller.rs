use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chat::{ConversationLog, Dispatch, PipelineGauge};
use crate::comment::Comment;
use crate::config::{ChatConfig, CommentSource, ConfigStore};
use crate::content::ContentEngine;
use crate::continuity::ContinuityEngine;
use crate::scheduler::{run_every, TickHandle};
use crate::transport::{PollSource, PushHandle, PushTransport, SocketConnector};

/// Selects one transport from configuration, paces it with a fixed-period
/// tick loop, and feeds the continuity engine on silent ticks.
pub struct IngestionController {
    store: ConfigStore,
    poll_source: Arc<dyn PollSource>,
    connector: Arc<dyn SocketConnector>,
    content: Arc<dyn ContentEngine>,
    log: Arc<dyn ConversationLog>,
    dispatch: Arc<dyn Dispatch>,
    pipeline: Arc<PipelineGauge>,
    continuity: ContinuityEngine,
}

impl IngestionController {
    pub fn new(
        store: ConfigStore,
        poll_source: Arc<dyn PollSource>,
        connector: Arc<dyn SocketConnector>,
        content: Arc<dyn ContentEngine>,
        log: Arc<dyn ConversationLog>,
        dispatch: Arc<dyn Dispatch>,
        pipeline: Arc<PipelineGauge>,
    ) -> Self {
        let continuity = ContinuityEngine::new(
            store.clone(),
            content.clone(),
            log.clone(),
            dispatch.clone(),
        );

        Self {
            store,
            poll_source,
            connector,
            content,
            log,
            dispatch,
            pipeline,
            continuity,
        }
    }

    /// Start the ingestion session for the currently configured transport.
    pub async fn start(self: &Arc<Self>) -> IngestionHandle {
        let config = self.store.config().await;
        let period = Duration::from_secs(config.poll_interval_secs.max(1));

        match config.comment_source {
            CommentSource::Api => {
                tracing::info!(
                    "Starting polled comment ingestion (every {}s)",
                    period.as_secs()
                );
                let controller = self.clone();
                let tick = run_every(period, move || {
                    let controller = controller.clone();
                    async move { controller.poll_tick().await }
                });

                IngestionHandle {
                    store: self.store.clone(),
                    tick: Some(tick),
                    push_shutdown: None,
                    push_task: None,
                    push: None,
                }
            }
            CommentSource::Push => {
                tracing::info!(
                    "Starting push comment ingestion (idle tick every {}s)",
                    period.as_secs()
                );
                let (comments_tx, comments_rx) = flume::unbounded();
                let push = PushTransport::new(
                    self.connector.clone(),
                    self.store.clone(),
                    comments_tx,
                )
                .start(config.socket_url.clone());

                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let controller = self.clone();
                let task =
                    tokio::spawn(
                        async move { controller.push_loop(comments_rx, shutdown_rx, period).await },
                    );

                IngestionHandle {
                    store: self.store.clone(),
                    tick: None,
                    push_shutdown: Some(shutdown_tx),
                    push_task: Some(task),
                    push: Some(push),
                }
            }
        }
    }

    /// One polling-mode tick: continuation first, then a page fetch, then
    /// either comment dispatch or the idle-counter branch. Failures are
    /// logged and skip the tick, never abort the loop.
    pub async fn poll_tick(&self) {
        let Some(config) = self.admit_poll().await else {
            return;
        };

        match self.continuity.continue_if_needed().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(error) => {
                tracing::warn!("Continuation check failed: {}", error);
                return;
            }
        }

        let token = self.store.page_token().await;
        let page = match self
            .poll_source
            .fetch_batch(&config.live_id, &config.api_key, &token)
            .await
        {
            Ok(Some(page)) => page,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!("Comment fetch failed: {}", error);
                return;
            }
        };

        // The provider's cursor advances even when the page had no usable
        // comments.
        self.store.set_page_token(page.next_page_token).await;

        if page.comments.is_empty() {
            if let Err(error) = self.continuity.handle_idle_tick().await {
                tracing::warn!("Idle tick handling failed: {}", error);
            }
            return;
        }

        if let Err(error) = self.process_batch(page.comments).await {
            tracing::warn!("Comment processing failed: {}", error);
        }
    }

    /// Push-mode loop. A single task owns both the comment channel and the
    /// idle interval, so continuity counters have exactly one writer per
    /// session.
    async fn push_loop(
        self: Arc<Self>,
        comments_rx: flume::Receiver<Vec<Comment>>,
        mut shutdown_rx: watch::Receiver<bool>,
        period: Duration,
    ) {
        let mut received_since_tick = false;
        // First idle tick lands a full period after start.
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                batch = comments_rx.recv_async() => match batch {
                    Ok(comments) => {
                        if self.admit_push().await.is_none() {
                            continue;
                        }
                        received_since_tick = true;
                        if let Err(error) = self.process_batch(comments).await {
                            tracing::warn!("Comment processing failed: {}", error);
                        }
                    }
                    Err(_) => break,
                },
                _ = interval.tick() => {
                    if self.admit_push().await.is_none() {
                        continue;
                    }

                    match self.continuity.continue_if_needed().await {
                        Ok(true) => {
                            received_since_tick = false;
                            continue;
                        }
                        Ok(false) => {}
                        Err(error) => {
                            tracing::warn!("Continuation check failed: {}", error);
                            continue;
                        }
                    }

                    if received_since_tick {
                        // Arrival already dispatched asynchronously; just
                        // acknowledge the activity.
                        received_since_tick = false;
                        self.store.set_no_comment_count(0).await;
                        continue;
                    }

                    if let Err(error) = self.continuity.handle_idle_tick().await {
                        tracing::warn!("Idle tick handling failed: {}", error);
                    }
                }
            }
        }
    }

    /// Reset silence counters, select one comment, and dispatch it. Returns
    /// whether a dispatch happened.
    async fn process_batch(&self, comments: Vec<Comment>) -> Result<bool> {
        if comments.is_empty() {
            return Ok(false);
        }

        self.continuity.note_comment_activity().await;

        let config = self.store.config().await;
        let selected = if config.continuity_mode {
            self.content
                .rank_best_comment(&self.log.messages(), &comments)
                .await?
        } else {
            let index = rand::thread_rng().gen_range(0..comments.len());
            comments[index].text.clone()
        };

        if selected.is_empty() {
            return Ok(false);
        }

        tracing::info!("Selected comment: {}", selected);
        self.dispatch.dispatch_comment(&selected).await?;
        Ok(true)
    }

    async fn admit_poll(&self) -> Option<ChatConfig> {
        let config = self.store.config().await;
        if !config.enabled || config.comment_source != CommentSource::Api {
            return None;
        }
        // Missing credentials: the tick no-ops silently.
        if config.live_id.is_empty() || config.api_key.is_empty() {
            return None;
        }
        if self.pipeline.is_busy() {
            return None;
        }
        Some(config)
    }

    async fn admit_push(&self) -> Option<ChatConfig> {
        let config = self.store.config().await;
        if !config.enabled || config.comment_source != CommentSource::Push {
            return None;
        }
        if self.pipeline.is_busy() {
            return None;
        }
        Some(config)
    }
}

/// A running ingestion session. `stop` tears down every timer and socket and
/// clears transport-local state, leaving no background activity.
pub struct IngestionHandle {
    store: ConfigStore,
    tick: Option<TickHandle>,
    push_shutdown: Option<watch::Sender<bool>>,
    push_task: Option<JoinHandle<()>>,
    push: Option<PushHandle>,
}

impl IngestionHandle {
    pub async fn stop(self) {
        if let Some(tick) = self.tick {
            tick.stop().await;
        }
        if let Some(shutdown) = self.push_shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.push_task {
            let _ = task.await;
        }
        if let Some(push) = self.push {
            push.stop().await;
        }
        self.store.reset_runtime_state().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, InMemoryConversationLog};
    use crate::transport::CommentPage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedPollSource {
        pages: Mutex<Vec<Option<CommentPage>>>,
        seen_tokens: Mutex<Vec<String>>,
    }

    impl ScriptedPollSource {
        fn new(pages: Vec<Option<CommentPage>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                seen_tokens: Mutex::new(Vec::new()),
            }
        }

        fn seen_tokens(&self) -> Vec<String> {
            self.seen_tokens.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl PollSource for ScriptedPollSource {
        async fn fetch_batch(
            &self,
            _live_id: &str,
            _api_key: &str,
            page_token: &str,
        ) -> Result<Option<CommentPage>> {
            self.seen_tokens
                .lock()
                .expect("lock")
                .push(page_token.to_string());
            let mut pages = self.pages.lock().expect("lock");
            if pages.is_empty() {
                anyhow::bail!("no scripted page left")
            }
            Ok(pages.remove(0))
        }
    }

    struct NeverConnector;

    #[async_trait]
    impl SocketConnector for NeverConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn crate::transport::SocketStream>> {
            anyhow::bail!("not used in this test")
        }
    }

    struct StaticContent {
        best: String,
    }

    #[async_trait]
    impl ContentEngine for StaticContent {
        async fn is_continuation_needed(&self, _history: &[ChatMessage]) -> Result<bool> {
            Ok(false)
        }

        async fn continuation_prompt(
            &self,
            _system_prompt: &str,
            _history: &[ChatMessage],
        ) -> Result<Vec<ChatMessage>> {
            Ok(vec![ChatMessage::new("assistant", "continuation")])
        }

        async fn new_topic(&self, _history: &[ChatMessage]) -> Result<String> {
            Ok("anything".to_string())
        }

        async fn new_topic_prompt(
            &self,
            _system_prompt: &str,
            _history: &[ChatMessage],
            _topic: &str,
        ) -> Result<Vec<ChatMessage>> {
            Ok(vec![ChatMessage::new("assistant", "topic")])
        }

        async fn sleep_prompt(
            &self,
            _system_prompt: &str,
            _history: &[ChatMessage],
        ) -> Result<Vec<ChatMessage>> {
            Ok(vec![ChatMessage::new("assistant", "sleep")])
        }

        async fn rank_best_comment(
            &self,
            _history: &[ChatMessage],
            _comments: &[Comment],
        ) -> Result<String> {
            Ok(self.best.clone())
        }
    }

    #[derive(Default)]
    struct RecordingDispatch {
        prompts: Mutex<Vec<String>>,
        comments: Mutex<Vec<String>>,
    }

    impl RecordingDispatch {
        fn comments(&self) -> Vec<String> {
            self.comments.lock().expect("lock").clone()
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Dispatch for RecordingDispatch {
        async fn dispatch_prompt(&self, messages: Vec<ChatMessage>) -> Result<()> {
            let content = messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.prompts.lock().expect("lock").push(content);
            Ok(())
        }

        async fn dispatch_comment(&self, text: &str) -> Result<()> {
            self.comments.lock().expect("lock").push(text.to_string());
            Ok(())
        }
    }

    fn comment(text: &str) -> Comment {
        Comment {
            user_name: "viewer".to_string(),
            user_icon_url: String::new(),
            text: text.to_string(),
        }
    }

    struct Fixture {
        controller: Arc<IngestionController>,
        store: ConfigStore,
        poll_source: Arc<ScriptedPollSource>,
        dispatch: Arc<RecordingDispatch>,
        pipeline: Arc<PipelineGauge>,
    }

    fn fixture(config: ChatConfig, pages: Vec<Option<CommentPage>>, best: &str) -> Fixture {
        let store = ConfigStore::new(config);
        let poll_source = Arc::new(ScriptedPollSource::new(pages));
        let dispatch = Arc::new(RecordingDispatch::default());
        let pipeline = Arc::new(PipelineGauge::new());
        let controller = Arc::new(IngestionController::new(
            store.clone(),
            poll_source.clone(),
            Arc::new(NeverConnector),
            Arc::new(StaticContent {
                best: best.to_string(),
            }),
            Arc::new(InMemoryConversationLog::new()),
            dispatch.clone(),
            pipeline.clone(),
        ));

        Fixture {
            controller,
            store,
            poll_source,
            dispatch,
            pipeline,
        }
    }

    fn polling_config() -> ChatConfig {
        let mut config = ChatConfig::default();
        config.enabled = true;
        config.comment_source = CommentSource::Api;
        config.live_id = "vid".to_string();
        config.api_key = "key".to_string();
        config
    }

    fn push_config() -> ChatConfig {
        let mut config = ChatConfig::default();
        config.enabled = true;
        config.comment_source = CommentSource::Push;
        config
    }

    #[tokio::test]
    async fn poll_tick_dispatches_a_comment_and_stores_the_cursor() {
        let page = CommentPage {
            comments: vec![comment("hello there")],
            next_page_token: "tok-1".to_string(),
        };
        let fx = fixture(polling_config(), vec![Some(page)], "");

        fx.store.set_no_comment_count(4).await;
        fx.store.set_sleep_mode(true).await;

        fx.controller.poll_tick().await;

        assert_eq!(fx.dispatch.comments(), vec!["hello there".to_string()]);
        assert_eq!(fx.store.page_token().await, "tok-1");
        assert_eq!(fx.store.no_comment_count().await, 0);
        assert!(!fx.store.sleep_mode().await);
    }

    #[tokio::test]
    async fn poll_tick_forwards_the_stored_cursor_unchanged() {
        let pages = vec![
            Some(CommentPage {
                comments: Vec::new(),
                next_page_token: "tok-1".to_string(),
            }),
            Some(CommentPage {
                comments: Vec::new(),
                next_page_token: "tok-2".to_string(),
            }),
        ];
        let fx = fixture(polling_config(), pages, "");

        fx.controller.poll_tick().await;
        fx.controller.poll_tick().await;

        assert_eq!(
            fx.poll_source.seen_tokens(),
            vec!["".to_string(), "tok-1".to_string()]
        );
        assert_eq!(fx.store.page_token().await, "tok-2");
    }

    #[tokio::test]
    async fn empty_page_runs_the_idle_branch() {
        let page = CommentPage {
            comments: Vec::new(),
            next_page_token: "tok-1".to_string(),
        };
        let mut config = polling_config();
        config.continuity_mode = true;
        let fx = fixture(config, vec![Some(page)], "");

        fx.controller.poll_tick().await;

        assert_eq!(fx.store.no_comment_count().await, 1);
        assert_eq!(fx.dispatch.prompts(), vec!["continuation".to_string()]);
        assert!(fx.dispatch.comments().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_session_skips_the_tick() {
        let fx = fixture(polling_config(), vec![None], "");

        fx.controller.poll_tick().await;

        assert_eq!(fx.store.no_comment_count().await, 0);
        assert_eq!(fx.store.page_token().await, "");
        assert!(fx.dispatch.comments().is_empty());
    }

    #[tokio::test]
    async fn fetch_error_skips_the_tick() {
        // No scripted pages: the source errors out.
        let fx = fixture(polling_config(), vec![], "");

        fx.controller.poll_tick().await;

        assert_eq!(fx.store.no_comment_count().await, 0);
        assert!(fx.dispatch.comments().is_empty());
    }

    #[tokio::test]
    async fn busy_pipeline_blocks_the_tick() {
        let page = CommentPage {
            comments: vec![comment("ignored")],
            next_page_token: "tok-1".to_string(),
        };
        let fx = fixture(polling_config(), vec![Some(page)], "");

        fx.pipeline.set_processing(true);
        fx.controller.poll_tick().await;
        assert!(fx.poll_source.seen_tokens().is_empty());

        fx.pipeline.set_processing(false);
        fx.controller.poll_tick().await;
        assert_eq!(fx.dispatch.comments(), vec!["ignored".to_string()]);
    }

    #[tokio::test]
    async fn disabled_or_credentialless_ticks_no_op() {
        let mut config = polling_config();
        config.enabled = false;
        let fx = fixture(config, vec![], "");
        fx.controller.poll_tick().await;
        assert!(fx.poll_source.seen_tokens().is_empty());

        let mut config = polling_config();
        config.api_key = String::new();
        let fx = fixture(config, vec![], "");
        fx.controller.poll_tick().await;
        assert!(fx.poll_source.seen_tokens().is_empty());
    }

    #[tokio::test]
    async fn continuity_mode_uses_ranked_selection() {
        let page = CommentPage {
            comments: vec![comment("first"), comment("second")],
            next_page_token: String::new(),
        };
        let mut config = polling_config();
        config.continuity_mode = true;
        let fx = fixture(config, vec![Some(page)], "second");

        fx.controller.poll_tick().await;
        assert_eq!(fx.dispatch.comments(), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn empty_ranking_result_means_no_dispatch() {
        let page = CommentPage {
            comments: vec![comment("first")],
            next_page_token: String::new(),
        };
        let mut config = polling_config();
        config.continuity_mode = true;
        let fx = fixture(config, vec![Some(page)], "");

        fx.controller.poll_tick().await;
        assert!(fx.dispatch.comments().is_empty());
        // Activity still reset the counters before selection.
        assert_eq!(fx.store.no_comment_count().await, 0);
    }

    #[tokio::test]
    async fn push_loop_dispatches_arrivals_and_counts_idle_ticks() {
        let mut config = push_config();
        config.continuity_mode = false;
        let fx = fixture(config, vec![], "");

        let (comments_tx, comments_rx) = flume::unbounded();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = fx.controller.clone();
        let task = tokio::spawn(async move {
            controller
                .push_loop(comments_rx, shutdown_rx, Duration::from_millis(20))
                .await
        });

        comments_tx
            .send(vec![comment("live one")])
            .expect("send batch");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.dispatch.comments(), vec!["live one".to_string()]);

        // The next idle tick clears the received flag instead of counting.
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(fx.store.no_comment_count().await, 0);

        // Silence after that increments the idle counter.
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(fx.store.no_comment_count().await >= 1);

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test]
    async fn stop_clears_cursor_and_continuity_state() {
        let page = CommentPage {
            comments: Vec::new(),
            next_page_token: "tok-9".to_string(),
        };
        let fx = fixture(polling_config(), vec![Some(page)], "");

        let handle = fx.controller.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;

        assert_eq!(fx.store.page_token().await, "");
        assert_eq!(fx.store.no_comment_count().await, 0);
        assert!(!fx.store.sleep_mode().await);
    }
}
