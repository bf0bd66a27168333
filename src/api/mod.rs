//! Typed protocol layer for the GraphQL endpoints.
//!
//! Everything here goes through [`Session`](crate::session::Session) so each
//! request is gated by the session's rate governor and counted.

pub mod error;
mod parse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use error::{ApiError, FetchError};

use crate::ratelimit::Gating;
use crate::session::{Credentials, Session};

pub const HOST: &str = "https://x.com";

/// Public web-client bearer token; cookie auth supplies the identity.
pub(crate) const BEARER: &str = "AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA";

/// Average posts per `UserMedia` page, used for fetch-depth estimation.
pub const PAGE_SIZE: u32 = 70;

/// Page size requested from the endpoint (it serves fewer on average).
const MEDIA_PAGE_COUNT: u32 = 100;

pub const USER_MEDIA_PATH: &str = "/i/api/graphql/MOLbHrtk8Ovu7DUNOLcXiA/UserMedia";
pub const USER_BY_SCREEN_NAME_PATH: &str =
    "/i/api/graphql/xmU6X_CKVnQ5lSrCbAmJsg/UserByScreenName";
pub const USER_BY_REST_ID_PATH: &str = "/i/api/graphql/CO4_gU4G_MRREoqfiTh6Hg/UserByRestId";
pub const FOLLOW_PATH: &str = "/i/api/1.1/friendships/create.json";

const USER_FEATURES: &str = r#"{"hidden_profile_subscriptions_enabled":true,"rweb_tipjar_consumption_enabled":true,"responsive_web_graphql_exclude_directive_enabled":true,"verified_phone_label_enabled":false,"subscriptions_verification_info_is_identity_verified_enabled":true,"subscriptions_verification_info_verified_since_enabled":true,"highlights_tweets_tab_ui_enabled":true,"responsive_web_twitter_article_notes_tab_enabled":true,"subscriptions_feature_can_gift_premium":false,"creator_subscriptions_tweet_preview_api_enabled":true,"responsive_web_graphql_skip_user_profile_image_extensions_enabled":false,"responsive_web_graphql_timeline_navigation_enabled":true}"#;

const MEDIA_FEATURES: &str = r#"{"rweb_tipjar_consumption_enabled":true,"responsive_web_graphql_exclude_directive_enabled":true,"verified_phone_label_enabled":false,"creator_subscriptions_tweet_preview_api_enabled":true,"responsive_web_graphql_timeline_navigation_enabled":true,"responsive_web_graphql_skip_user_profile_image_extensions_enabled":false,"communities_web_enable_tweet_community_results_fetch":true,"c9s_tweet_anatomy_moderator_badge_enabled":true,"articles_preview_enabled":true,"tweetypie_unmention_optimization_enabled":true,"responsive_web_edit_tweet_api_enabled":true,"graphql_is_translatable_rweb_tweet_is_translatable_enabled":true,"view_counts_everywhere_api_enabled":true,"longform_notetweets_consumption_enabled":true,"responsive_web_twitter_article_tweet_consumption_enabled":true,"tweet_awards_web_tipping_enabled":false,"creator_subscriptions_quote_tweet_preview_enabled":false,"freedom_of_speech_not_reach_fetch_enabled":true,"standardized_nudges_misinfo":true,"tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled":true,"rweb_video_timestamps_enabled":true,"longform_notetweets_rich_text_read_enabled":true,"longform_notetweets_inline_media_enabled":true,"responsive_web_enhance_cards_enabled":false}"#;

/// Follow relationship between the session's account and a target account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    Unfollowed,
    Following,
    Requested,
}

/// Account profile as served by the user endpoints.
#[derive(Debug, Clone)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub screen_name: String,
    pub protected: bool,
    pub friends_count: u32,
    pub media_count: u32,
    pub follow_state: FollowState,
    pub muting: bool,
    pub blocking: bool,
}

impl User {
    pub fn title(&self) -> String {
        format!("{}({})", self.name, self.screen_name)
    }

    /// Content is visible when the account is public, or protected but
    /// followed by the operator.
    pub fn is_visible(&self) -> bool {
        self.follow_state == FollowState::Following || !self.protected
    }

    /// Muted or blocked accounts are never synced.
    pub fn is_ignored(&self) -> bool {
        self.muting || self.blocking
    }
}

/// One media post: identity, timestamp, text, and the direct media URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub text: String,
    pub media_urls: Vec<String>,
}

/// One page of a media timeline.
#[derive(Debug, Clone)]
pub struct TimelinePage {
    pub posts: Vec<Post>,
    pub next_cursor: Option<String>,
}

/// Source of media timeline pages. The production implementation speaks the
/// GraphQL endpoint; tests substitute canned pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn media_page(
        &self,
        session: &Session,
        account_id: u64,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TimelinePage, FetchError>;
}

/// The real `UserMedia` endpoint.
pub struct GraphqlTimeline;

#[async_trait]
impl PageSource for GraphqlTimeline {
    async fn media_page(
        &self,
        session: &Session,
        account_id: u64,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TimelinePage, FetchError> {
        let url = user_media_url(account_id, cursor)?;
        let body = session.get_json(url, Gating::NonBlocking, cancel).await?;
        parse::parse_media_page(&body)
    }
}

/// Fetch all posts for `account_id` newer than `since`, paging until a page
/// comes back empty or the cutoff is reached. Posts are returned
/// newest-first, the order the timeline serves them in.
pub async fn fetch_media_since(
    source: &dyn PageSource,
    session: &Session,
    account_id: u64,
    since: Option<DateTime<Utc>>,
    cancel: &CancellationToken,
) -> Result<Vec<Post>, FetchError> {
    let mut all = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = source
            .media_page(session, account_id, cursor.as_deref(), cancel)
            .await?;
        if page.posts.is_empty() {
            break;
        }
        cursor = page.next_cursor;

        let mut reached_cutoff = false;
        for post in page.posts {
            if since.is_some_and(|min| post.created_at <= min) {
                reached_cutoff = true;
                break;
            }
            all.push(post);
        }
        if reached_cutoff || cursor.is_none() {
            break;
        }
    }

    Ok(all)
}

pub async fn user_by_screen_name(
    session: &Session,
    screen_name: &str,
    cancel: &CancellationToken,
) -> Result<User, FetchError> {
    let variables = format!(r#"{{"screen_name":"{screen_name}","withSafetyModeUserFields":true}}"#);
    let url = endpoint_url(
        USER_BY_SCREEN_NAME_PATH,
        &[
            ("variables", variables.as_str()),
            ("features", USER_FEATURES),
            ("fieldToggles", r#"{"withAuxiliaryUserLabels":false}"#),
        ],
    )?;
    let body = session.get_json(url, Gating::Blocking, cancel).await?;
    parse::parse_user(&body)
}

pub async fn user_by_id(
    session: &Session,
    id: u64,
    cancel: &CancellationToken,
) -> Result<User, FetchError> {
    let variables = format!(r#"{{"userId":"{id}","withSafetyModeUserFields":true}}"#);
    let url = endpoint_url(
        USER_BY_REST_ID_PATH,
        &[("variables", variables.as_str()), ("features", USER_FEATURES)],
    )?;
    let body = session.get_json(url, Gating::Blocking, cancel).await?;
    parse::parse_user(&body)
}

/// Send a follow request (used for protected accounts with `--auto-follow`).
pub async fn follow(
    session: &Session,
    user_id: u64,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let url = endpoint_url(FOLLOW_PATH, &[])?;
    let id = user_id.to_string();
    session
        .post_form(url, &[("user_id", id.as_str())], Gating::Blocking, cancel)
        .await?;
    Ok(())
}

/// Resolve the identity behind a set of cookies by scraping the home page.
/// The page only renders the signed-in account when the cookies are valid,
/// so an empty result means the credentials were rejected.
pub async fn self_screen_name(creds: &Credentials) -> anyhow::Result<String> {
    let probe = reqwest::Client::builder()
        .user_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        )
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let resp = probe
        .get(format!("{HOST}/home"))
        .header(
            reqwest::header::COOKIE,
            format!("auth_token={}; ct0={}", creds.auth_token, creds.csrf_token),
        )
        .send()
        .await?
        .error_for_status()?;
    let home = resp.text().await?;
    parse::extract_screen_name(&home)
        .ok_or_else(|| anyhow::anyhow!("could not resolve a screen name from these cookies"))
}

pub(crate) fn api_error_in(body: &serde_json::Value) -> Option<ApiError> {
    parse::api_error(body)
}

fn user_media_url(account_id: u64, cursor: Option<&str>) -> Result<Url, FetchError> {
    let variables = format!(
        r#"{{"userId":"{account_id}","count":{MEDIA_PAGE_COUNT},"cursor":"{}","includePromotedContent":false,"withClientEventToken":false,"withBirdwatchNotes":false,"withVoice":true,"withV2Timeline":true}}"#,
        cursor.unwrap_or_default(),
    );
    endpoint_url(
        USER_MEDIA_PATH,
        &[
            ("variables", variables.as_str()),
            ("features", MEDIA_FEATURES),
            ("fieldToggles", r#"{"withArticlePlainText":false}"#),
        ],
    )
}

fn endpoint_url(path: &str, params: &[(&str, &str)]) -> Result<Url, FetchError> {
    let base = format!("{HOST}{path}");
    if params.is_empty() {
        Url::parse(&base)
    } else {
        Url::parse_with_params(&base, params)
    }
    .map_err(|e| FetchError::Parse(format!("bad endpoint url: {e}")))
}
