use serde_json::Value;
use std::collections::HashSet;

/// Display name used when a payload carries no usable author name.
pub const DEFAULT_USER_NAME: &str = "YouTubeUser";

/// Service tag expected on push-feed entries. Entries tagged with a different
/// service are dropped; untagged entries pass through.
const EXPECTED_SERVICE: &str = "youtube";

/// A viewer comment in canonical form. Created by normalization, consumed
/// once by comment selection, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub user_name: String,
    pub user_icon_url: String,
    pub text: String,
}

/// Map a push-feed envelope (`{type: "comments", data: {comments: [..]}}`)
/// into canonical comments, preserving input order.
///
/// A malformed entry is skipped, not fatal to the batch. When `dedup` is
/// given, entries whose `id` is already present are skipped and accepted ids
/// are inserted.
pub fn map_push_payload(payload: &Value, mut dedup: Option<&mut HashSet<String>>) -> Vec<Comment> {
    let Some(envelope) = payload.as_object() else {
        return Vec::new();
    };

    if envelope.get("type").and_then(Value::as_str) != Some("comments") {
        return Vec::new();
    }

    let Some(data) = envelope.get("data").and_then(Value::as_object) else {
        return Vec::new();
    };

    let Some(entries) = data.get("comments").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut comments = Vec::new();

    for entry in entries {
        let Some(raw) = entry.as_object() else {
            continue;
        };

        let service = raw.get("service").and_then(Value::as_str).unwrap_or("");
        if !service.is_empty() && service != EXPECTED_SERVICE {
            continue;
        }

        let comment_id = raw.get("id").and_then(Value::as_str);
        if let (Some(id), Some(seen)) = (comment_id, dedup.as_deref()) {
            if seen.contains(id) {
                continue;
            }
        }

        let inner = raw
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let text = pick_first_string(&[
            inner.get("comment"),
            inner.get("speechText"),
            inner.get("text"),
            raw.get("comment"),
        ]);
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let user_name = pick_first_string(&[
            inner.get("displayName"),
            inner.get("name"),
            raw.get("name"),
        ]);

        let user_icon_url = inner
            .get("profileImage")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        comments.push(Comment {
            user_name: if user_name.is_empty() {
                DEFAULT_USER_NAME.to_string()
            } else {
                user_name
            },
            user_icon_url,
            text,
        });

        if let (Some(id), Some(seen)) = (comment_id, dedup.as_deref_mut()) {
            seen.insert(id.to_string());
        }
    }

    comments
}

/// First candidate that is a non-empty string after trimming, or `""`.
fn pick_first_string(candidates: &[Option<&Value>]) -> String {
    for candidate in candidates {
        if let Some(text) = candidate.and_then(Value::as_str) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}
