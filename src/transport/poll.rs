use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::comment::Comment;

const YOUTUBE_API_BASE: &str = "https://youtube.googleapis.com/youtube/v3";

/// One page of live chat messages plus the cursor for the next page.
#[derive(Debug, Clone, Default)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub next_page_token: String,
}

/// Polled comment feed. Invoked on a fixed period by the controller; does not
/// self-schedule.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Fetch one page of comments. `Ok(None)` means the live session could
    /// not be resolved and this tick should be skipped entirely.
    async fn fetch_batch(
        &self,
        live_id: &str,
        api_key: &str,
        page_token: &str,
    ) -> Result<Option<CommentPage>>;
}

// ========================================================================
// YouTube Data API response views
// ========================================================================

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    #[serde(default)]
    live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
    #[serde(default)]
    active_live_chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    items: Vec<MessageItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageItem {
    #[serde(default)]
    author_details: Option<AuthorDetails>,
    #[serde(default)]
    snippet: Option<MessageSnippet>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AuthorDetails {
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    profile_image_url: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MessageSnippet {
    #[serde(default)]
    text_message_details: Option<TextMessageDetails>,
    #[serde(default)]
    super_chat_details: Option<SuperChatDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextMessageDetails {
    #[serde(default)]
    message_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuperChatDetails {
    #[serde(default)]
    user_comment: String,
}

// ========================================================================
// YouTube poll source
// ========================================================================

pub struct YouTubePollSource {
    base_url: String,
    client: reqwest::Client,
}

impl YouTubePollSource {
    pub fn new() -> Self {
        Self::with_base_url(YOUTUBE_API_BASE.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Resolve the active live chat handle for a video. `Ok(None)` when the
    /// video is unknown or not live.
    async fn resolve_live_chat_id(&self, live_id: &str, api_key: &str) -> Result<Option<String>> {
        let url = format!("{}/videos", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("part", "liveStreamingDetails"),
                ("id", live_id),
                ("key", api_key),
            ])
            .send()
            .await
            .context("Failed to query video details")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Video lookup failed: {} - {}", status, body);
        }

        let videos: VideoListResponse = response
            .json()
            .await
            .context("Failed to decode video details")?;

        Ok(videos
            .items
            .into_iter()
            .next()
            .and_then(|item| item.live_streaming_details)
            .and_then(|details| details.active_live_chat_id)
            .filter(|id| !id.is_empty()))
    }

    async fn fetch_message_page(
        &self,
        live_chat_id: &str,
        api_key: &str,
        page_token: &str,
    ) -> Result<CommentPage> {
        let url = format!("{}/liveChat/messages", self.base_url);
        let mut request = self.client.get(&url).query(&[
            ("liveChatId", live_chat_id),
            ("part", "authorDetails,snippet"),
            ("key", api_key),
        ]);
        if !page_token.is_empty() {
            request = request.query(&[("pageToken", page_token)]);
        }

        let response = request
            .send()
            .await
            .context("Failed to fetch live chat messages")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Live chat fetch failed: {} - {}", status, body);
        }

        let page: MessageListResponse = response
            .json()
            .await
            .context("Failed to decode live chat messages")?;

        Ok(CommentPage {
            comments: map_message_items(page.items),
            next_page_token: page.next_page_token.unwrap_or_default(),
        })
    }
}

impl Default for YouTubePollSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PollSource for YouTubePollSource {
    async fn fetch_batch(
        &self,
        live_id: &str,
        api_key: &str,
        page_token: &str,
    ) -> Result<Option<CommentPage>> {
        let Some(live_chat_id) = self.resolve_live_chat_id(live_id, api_key).await? else {
            tracing::debug!("No active live chat for video {}", live_id);
            return Ok(None);
        };

        let page = self
            .fetch_message_page(&live_chat_id, api_key, page_token)
            .await?;
        Ok(Some(page))
    }
}

fn map_message_items(items: Vec<MessageItem>) -> Vec<Comment> {
    items
        .into_iter()
        .filter_map(|item| {
            let snippet = item.snippet.unwrap_or_default();
            let text = snippet
                .text_message_details
                .map(|d| d.message_text)
                .filter(|t| !t.is_empty())
                .or_else(|| {
                    snippet
                        .super_chat_details
                        .map(|d| d.user_comment)
                        .filter(|t| !t.is_empty())
                })
                .unwrap_or_default();

            if text.is_empty() || text.starts_with('#') {
                return None;
            }

            let author = item.author_details.unwrap_or_default();
            Some(Comment {
                user_name: author.display_name,
                user_icon_url: author.profile_image_url,
                text,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_video_response_to_chat_id() {
        let payload = json!({
            "items": [{
                "liveStreamingDetails": {"activeLiveChatId": "chat-1"}
            }]
        });
        let decoded: VideoListResponse = serde_json::from_value(payload).expect("decode");
        let chat_id = decoded
            .items
            .into_iter()
            .next()
            .and_then(|i| i.live_streaming_details)
            .and_then(|d| d.active_live_chat_id);
        assert_eq!(chat_id.as_deref(), Some("chat-1"));
    }

    #[test]
    fn empty_items_means_no_session() {
        let decoded: VideoListResponse =
            serde_json::from_value(json!({"items": []})).expect("decode");
        assert!(decoded.items.is_empty());
    }

    #[test]
    fn maps_text_and_super_chat_messages() {
        let payload = json!({
            "items": [
                {
                    "authorDetails": {"displayName": "alice", "profileImageUrl": "http://a"},
                    "snippet": {"textMessageDetails": {"messageText": "hi there"}}
                },
                {
                    "authorDetails": {"displayName": "bob"},
                    "snippet": {"superChatDetails": {"userComment": "take my money"}}
                },
                {
                    "authorDetails": {"displayName": "carol"},
                    "snippet": {"textMessageDetails": {"messageText": "#tag"}}
                },
                {
                    "authorDetails": {"displayName": "dave"},
                    "snippet": {}
                }
            ],
            "nextPageToken": "tok-2"
        });

        let decoded: MessageListResponse = serde_json::from_value(payload).expect("decode");
        assert_eq!(decoded.next_page_token.as_deref(), Some("tok-2"));

        let comments = map_message_items(decoded.items);
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].user_name, "alice");
        assert_eq!(comments[0].user_icon_url, "http://a");
        assert_eq!(comments[0].text, "hi there");
        assert_eq!(comments[1].text, "take my money");
    }

    #[test]
    fn missing_next_page_token_becomes_empty() {
        let decoded: MessageListResponse =
            serde_json::from_value(json!({"items": []})).expect("decode");
        let page = CommentPage {
            comments: map_message_items(decoded.items),
            next_page_token: decoded.next_page_token.unwrap_or_default(),
        };
        assert!(page.comments.is_empty());
        assert_eq!(page.next_page_token, "");
    }
}
