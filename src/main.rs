use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use streamtalk::chat::{ChatMessage, ConversationLog, Dispatch, InMemoryConversationLog, PipelineGauge};
use streamtalk::config::ChatConfig;
use streamtalk::config::ConfigStore;
use streamtalk::content::LlmContentEngine;
use streamtalk::controller::IngestionController;
use streamtalk::transport::{TungsteniteConnector, YouTubePollSource};

/// Downstream executor for the standalone binary: selected comments and
/// generated prompts land in the conversation log and the process log.
/// Embedders replace this with their own response pipeline.
struct LoggingDispatch {
    log: Arc<InMemoryConversationLog>,
    pipeline: Arc<PipelineGauge>,
}

#[async_trait]
impl Dispatch for LoggingDispatch {
    async fn dispatch_prompt(&self, messages: Vec<ChatMessage>) -> Result<()> {
        self.pipeline.set_processing(true);
        for message in messages {
            tracing::info!("[{}] {}", message.role, message.content);
            self.log.push(message);
        }
        self.pipeline.set_processing(false);
        Ok(())
    }

    async fn dispatch_comment(&self, text: &str) -> Result<()> {
        self.pipeline.set_processing(true);
        tracing::info!("Viewer comment: {}", text);
        self.log.push(ChatMessage::new("user", text));
        self.pipeline.set_processing(false);
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,streamtalk=debug")),
        )
        .init();

    let config = ChatConfig::load();
    tracing::info!(
        "Comment source: {:?}, config file: {}",
        config.comment_source,
        ChatConfig::config_path().display()
    );

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: ChatConfig) -> Result<()> {
    let content = Arc::new(LlmContentEngine::new(
        config.llm_api_url.clone(),
        config.llm_model.clone(),
        config.llm_api_key.clone(),
    ));
    let log = Arc::new(InMemoryConversationLog::new());
    let pipeline = Arc::new(PipelineGauge::new());
    let dispatch = Arc::new(LoggingDispatch {
        log: log.clone(),
        pipeline: pipeline.clone(),
    });

    let store = ConfigStore::new(config);
    let controller = Arc::new(IngestionController::new(
        store,
        Arc::new(YouTubePollSource::new()),
        Arc::new(TungsteniteConnector),
        content,
        log as Arc<dyn ConversationLog>,
        dispatch,
        pipeline,
    ));

    let handle = controller.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    handle.stop().await;

    Ok(())
}
