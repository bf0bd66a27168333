//! Response-body parsing for the GraphQL endpoints.
//!
//! Timelines arrive as instruction lists; `TimelineAddEntries` carries the
//! page's entries (tweets plus a bottom cursor), `TimelineAddToModule`
//! carries grid module items. Tweets are nested under
//! `itemContent.tweet_results.result`, with an extra `tweet` wrapper for
//! `TweetWithVisibilityResults`.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::error::{ApiError, FetchError};
use super::{FollowState, Post, TimelinePage, User};

/// Legacy timestamp format used in tweet payloads,
/// e.g. `Wed Oct 10 20:19:24 +0000 2018`.
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Extract a body-level error, if the response carries one.
pub(super) fn api_error(body: &Value) -> Option<ApiError> {
    let first = body.get("errors")?.as_array()?.first()?;
    Some(ApiError {
        code: first.get("code").and_then(Value::as_i64).unwrap_or(-1),
        message: first
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Parse a `UserByScreenName` / `UserByRestId` response.
pub(super) fn parse_user(body: &Value) -> Result<User, FetchError> {
    let result = body
        .pointer("/data/user/result")
        .ok_or_else(|| FetchError::Parse("user result missing".into()))?;
    if result.get("__typename").and_then(Value::as_str) == Some("UserUnavailable") {
        return Err(FetchError::Parse("user is unavailable".into()));
    }
    let legacy = result
        .get("legacy")
        .ok_or_else(|| FetchError::Parse("user legacy payload missing".into()))?;
    let id = result
        .get("rest_id")
        .and_then(as_u64)
        .ok_or_else(|| FetchError::Parse("user rest_id missing".into()))?;

    let flag = |name: &str| legacy.get(name).and_then(Value::as_bool).unwrap_or(false);
    let follow_state = if legacy.get("following").is_some() {
        if flag("following") {
            FollowState::Following
        } else {
            FollowState::Unfollowed
        }
    } else if legacy.get("follow_request_sent").is_some() {
        FollowState::Requested
    } else {
        FollowState::Unfollowed
    };

    Ok(User {
        id,
        name: legacy
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        screen_name: legacy
            .get("screen_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        protected: flag("protected"),
        friends_count: legacy
            .get("friends_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        media_count: legacy
            .get("media_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        follow_state,
        muting: flag("muting"),
        blocking: flag("blocking"),
    })
}

/// Parse one `UserMedia` page into posts (reverse-chronological, as served)
/// and the bottom cursor.
pub(super) fn parse_media_page(body: &Value) -> Result<TimelinePage, FetchError> {
    let instructions = body
        .pointer("/data/user/result/timeline_v2/timeline/instructions")
        .or_else(|| body.pointer("/data/user/result/timeline/timeline/instructions"))
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Parse("timeline instructions missing".into()))?;

    let mut posts = Vec::new();
    let mut next_cursor = None;

    for instruction in instructions {
        match instruction.get("type").and_then(Value::as_str) {
            Some("TimelineAddEntries") => {
                let entries = instruction
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for entry in entries {
                    let Some(content) = entry.get("content") else {
                        continue;
                    };
                    match content.get("entryType").and_then(Value::as_str) {
                        Some("TimelineTimelineCursor") => {
                            if content.get("cursorType").and_then(Value::as_str) == Some("Bottom") {
                                next_cursor = content
                                    .get("value")
                                    .and_then(Value::as_str)
                                    .map(str::to_string);
                            }
                        }
                        Some("TimelineTimelineModule") => {
                            let items = content
                                .get("items")
                                .and_then(Value::as_array)
                                .map(Vec::as_slice)
                                .unwrap_or_default();
                            for item in items {
                                if let Some(post) = item
                                    .pointer("/item/itemContent/tweet_results")
                                    .and_then(parse_tweet_results)
                                {
                                    posts.push(post);
                                }
                            }
                        }
                        _ => {
                            if let Some(post) = content
                                .pointer("/itemContent/tweet_results")
                                .and_then(parse_tweet_results)
                            {
                                posts.push(post);
                            }
                        }
                    }
                }
            }
            Some("TimelineAddToModule") => {
                let items = instruction
                    .get("moduleItems")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for item in items {
                    if let Some(post) = item
                        .pointer("/item/itemContent/tweet_results")
                        .and_then(parse_tweet_results)
                    {
                        posts.push(post);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(TimelinePage { posts, next_cursor })
}

/// Parse a `tweet_results` object into a [`Post`]. Tombstoned or otherwise
/// unreadable tweets and tweets without media yield `None`.
fn parse_tweet_results(tweet_results: &Value) -> Option<Post> {
    let mut result = tweet_results.get("result")?;
    match result.get("__typename").and_then(Value::as_str) {
        Some("TweetTombstone") => return None,
        Some("TweetWithVisibilityResults") => result = result.get("tweet")?,
        _ => {}
    }
    let legacy = result.get("legacy")?;

    let id = result.get("rest_id").and_then(as_u64)?;
    let created_at = parse_created_at(legacy.get("created_at")?.as_str()?)?;
    let text = legacy
        .get("full_text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let media = legacy
        .pointer("/extended_entities/media")
        .and_then(Value::as_array)?;
    let mut media_urls = Vec::with_capacity(media.len());
    for entry in media {
        match entry.get("type").and_then(Value::as_str) {
            Some("photo") => {
                if let Some(url) = entry.get("media_url_https").and_then(Value::as_str) {
                    media_urls.push(url.to_string());
                }
            }
            Some("video") | Some("animated_gif") => {
                // Variants are sorted by ascending bitrate; take the best.
                if let Some(url) = entry
                    .pointer("/video_info/variants")
                    .and_then(Value::as_array)
                    .and_then(|v| v.last())
                    .and_then(|v| v.get("url"))
                    .and_then(Value::as_str)
                {
                    media_urls.push(url.to_string());
                }
            }
            _ => {}
        }
    }
    if media_urls.is_empty() {
        return None;
    }

    Some(Post {
        id,
        created_at,
        text,
        media_urls,
    })
}

fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract `"screen_name":"…"` from the home page HTML, used to resolve the
/// identity behind a set of session cookies.
pub(super) fn extract_screen_name(home: &str) -> Option<String> {
    let marker = "\"screen_name\":\"";
    let start = home.find(marker)? + marker.len();
    let rest = &home[start..];
    let end = rest.find('"')?;
    let name = &rest[..end];
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(name.to_string())
}
