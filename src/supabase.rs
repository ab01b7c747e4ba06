use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::media;
use crate::model::{
    Comment, Like, NewComment, NewPost, PageRange, Post, Profile, ProfileUpdate, UserPost,
    UNKNOWN_USERNAME,
};

const FEED_SELECT: &str = "id,user_id,image_url,park_name,caption,latitude,longitude,created_at,updated_at,profiles!posts_user_id_fkey(username,avatar_url,bio),likes!likes_post_id_fkey(count),comments!comments_post_id_fkey(count)";
const COMMENT_SELECT: &str = "id,post_id,user_id,content,parent_comment_id,created_at,updated_at,profiles!comments_user_id_fkey(username,avatar_url)";
const USER_POST_SELECT: &str = "id,image_url,park_name,caption,created_at";

/// Supplies the bearer token for requests. `None` falls back to the
/// project's anon key.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

pub struct AnonToken;

impl TokenProvider for AnonToken {
    fn access_token(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub anon_key: String,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    tokens: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    anon_key: String,
    base_url: Url,
}

impl Client {
    pub fn new(tokens: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            bail!("supabase: backend url required");
        }
        if config.anon_key.trim().is_empty() {
            bail!("supabase: anon key required");
        }
        if config.user_agent.trim().is_empty() {
            bail!("supabase: user agent required");
        }
        let base_url = parse_base_url(&config.base_url)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            tokens,
            http,
            user_agent: config.user_agent,
            anon_key: config.anon_key,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// One page of the home feed, newest first, with `user_liked` derived
    /// for `viewer`.
    pub fn posts(&self, viewer: &str, range: PageRange) -> Result<Vec<Post>> {
        let params = [
            ("select", FEED_SELECT.to_string()),
            ("order", "created_at.desc".to_string()),
            ("offset", range.offset.to_string()),
            ("limit", range.limit.to_string()),
        ];
        let rows: Vec<PostRow> = self
            .fetch(Method::GET, "posts", &params)
            .context("supabase: fetch posts")?;

        let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        let liked = if viewer.is_empty() || ids.is_empty() {
            HashSet::new()
        } else {
            self.liked_post_ids(viewer, &ids).unwrap_or_else(|err| {
                log::warn!("supabase: viewer likes unavailable: {:#}", err);
                HashSet::new()
            })
        };

        Ok(rows.into_iter().map(|row| row.into_post(&liked)).collect())
    }

    pub fn liked_post_ids(&self, user_id: &str, post_ids: &[&str]) -> Result<HashSet<String>> {
        let list = post_ids
            .iter()
            .map(|id| format!("\"{}\"", id))
            .collect::<Vec<_>>()
            .join(",");
        let params = [
            ("select", "post_id".to_string()),
            ("user_id", format!("eq.{}", user_id)),
            ("post_id", format!("in.({})", list)),
        ];
        let rows: Vec<PostIdRow> = self
            .fetch(Method::GET, "likes", &params)
            .context("supabase: fetch viewer likes")?;
        Ok(rows.into_iter().map(|row| row.post_id).collect())
    }

    pub fn find_like(&self, user_id: &str, post_id: &str) -> Result<Option<Like>> {
        let params = [
            ("select", "id,user_id,post_id".to_string()),
            ("user_id", format!("eq.{}", user_id)),
            ("post_id", format!("eq.{}", post_id)),
            ("limit", "1".to_string()),
        ];
        let rows: Vec<Like> = self
            .fetch(Method::GET, "likes", &params)
            .context("supabase: fetch like")?;
        Ok(rows.into_iter().next())
    }

    pub fn insert_like(&self, user_id: &str, post_id: &str) -> Result<()> {
        let req = self
            .rest(Method::POST, "likes", &[])?
            .header("Prefer", "return=minimal")
            .json(&json!({ "user_id": user_id, "post_id": post_id }));
        self.send(req).context("supabase: insert like")?;
        Ok(())
    }

    pub fn delete_like(&self, user_id: &str, post_id: &str) -> Result<()> {
        let params = [
            ("user_id", format!("eq.{}", user_id)),
            ("post_id", format!("eq.{}", post_id)),
        ];
        let req = self.rest(Method::DELETE, "likes", &params)?;
        self.send(req).context("supabase: delete like")?;
        Ok(())
    }

    /// Comments of a post, oldest first. `parent` of `None` selects root
    /// level comments only.
    pub fn comments(&self, post_id: &str, parent: Option<&str>) -> Result<Vec<Comment>> {
        let parent_filter = match parent {
            Some(id) => format!("eq.{}", id),
            None => "is.null".to_string(),
        };
        let params = [
            ("select", COMMENT_SELECT.to_string()),
            ("post_id", format!("eq.{}", post_id)),
            ("parent_comment_id", parent_filter),
            ("order", "created_at.asc".to_string()),
        ];
        let rows: Vec<CommentRow> = self
            .fetch(Method::GET, "comments", &params)
            .context("supabase: fetch comments")?;
        Ok(rows.into_iter().map(CommentRow::into_comment).collect())
    }

    pub fn insert_comment(&self, comment: &NewComment) -> Result<String> {
        let req = self
            .rest(Method::POST, "comments", &[("select", "id".to_string())])?
            .header("Prefer", "return=representation")
            .json(comment);
        let rows: Vec<IdRow> = self
            .send(req)
            .context("supabase: insert comment")?
            .json()
            .context("supabase: decode inserted comment")?;
        rows.into_iter()
            .next()
            .map(|row| row.id)
            .ok_or_else(|| anyhow!("supabase: insert comment returned no id"))
    }

    pub fn delete_comment(&self, comment_id: &str) -> Result<()> {
        let req = self.rest(
            Method::DELETE,
            "comments",
            &[("id", format!("eq.{}", comment_id))],
        )?;
        self.send(req).context("supabase: delete comment")?;
        Ok(())
    }

    pub fn profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let params = [
            ("select", "*".to_string()),
            ("id", format!("eq.{}", user_id)),
            ("limit", "1".to_string()),
        ];
        let rows: Vec<Profile> = self
            .fetch(Method::GET, "profiles", &params)
            .context("supabase: fetch profile")?;
        Ok(rows.into_iter().next())
    }

    pub fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let req = self
            .rest(Method::PATCH, "profiles", &[("id", format!("eq.{}", user_id))])?
            .json(update);
        self.send(req).context("supabase: update profile")?;
        Ok(())
    }

    pub fn user_posts(&self, user_id: &str) -> Result<Vec<UserPost>> {
        let params = [
            ("select", USER_POST_SELECT.to_string()),
            ("user_id", format!("eq.{}", user_id)),
            ("order", "created_at.desc".to_string()),
        ];
        self.fetch(Method::GET, "posts", &params)
            .context("supabase: fetch user posts")
    }

    pub fn insert_post(&self, post: &NewPost) -> Result<()> {
        let req = self
            .rest(Method::POST, "posts", &[])?
            .header("Prefer", "return=minimal")
            .json(post);
        self.send(req).context("supabase: insert post")?;
        Ok(())
    }

    pub fn update_post_caption(&self, post_id: &str, caption: Option<&str>) -> Result<()> {
        let req = self
            .rest(Method::PATCH, "posts", &[("id", format!("eq.{}", post_id))])?
            .json(&json!({ "caption": caption }));
        self.send(req).context("supabase: update post")?;
        Ok(())
    }

    pub fn delete_post(&self, post_id: &str) -> Result<()> {
        let req = self.rest(Method::DELETE, "posts", &[("id", format!("eq.{}", post_id))])?;
        self.send(req).context("supabase: delete post")?;
        Ok(())
    }

    pub fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let url = self
            .base_url
            .join(&format!("storage/v1/object/{}/{}", bucket, path.trim_start_matches('/')))?;
        let req = self
            .authorized(self.http.request(Method::POST, url))
            .header("x-upsert", "true")
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        self.send(req)
            .with_context(|| format!("supabase: upload {}/{}", bucket, path))?;
        Ok(())
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        media::public_url(&self.base_url, bucket, path)
    }

    fn fetch<T>(&self, method: Method, table: &str, params: &[(&str, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let req = self.rest(method, table, params)?;
        let resp = self.send(req)?;
        let payload = resp.json()?;
        Ok(payload)
    }

    fn rest(&self, method: Method, table: &str, params: &[(&str, String)]) -> Result<RequestBuilder> {
        let mut url = self.base_url.join(&format!("rest/v1/{}", table))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        Ok(self.authorized(self.http.request(method, url)))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let token = self
            .tokens
            .access_token()
            .unwrap_or_else(|| self.anon_key.clone());
        req.header(USER_AGENT, self.user_agent.clone())
            .header("apikey", self.anon_key.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token))
    }

    fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send()?;
        check_status(resp)
    }
}

pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    Url::parse(&normalized).with_context(|| format!("supabase: invalid backend url {:?}", raw))
}

pub(crate) fn check_status(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    match status.as_u16() {
        401 => Err(anyhow!("supabase: unauthorized")),
        403 => Err(anyhow!("supabase: forbidden")),
        404 => Err(anyhow!("supabase: not found")),
        409 => Err(anyhow!("supabase: conflict: {}", body)),
        _ => Err(anyhow!("supabase: api error {}: {}", status, body)),
    }
}

#[derive(Debug, Deserialize)]
struct PostRow {
    id: String,
    user_id: String,
    image_url: String,
    park_name: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    profiles: Option<AuthorRow>,
    #[serde(default)]
    likes: Vec<CountRow>,
    #[serde(default)]
    comments: Vec<CountRow>,
}

impl PostRow {
    fn into_post(self, liked: &HashSet<String>) -> Post {
        let author = self.profiles.unwrap_or_default();
        let user_liked = liked.contains(&self.id);
        Post {
            user_liked,
            id: self.id,
            user_id: self.user_id,
            image_url: self.image_url,
            park_name: self.park_name,
            caption: self.caption,
            latitude: self.latitude,
            longitude: self.longitude,
            created_at: self.created_at,
            updated_at: self.updated_at,
            username: author
                .username
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNKNOWN_USERNAME.to_string()),
            avatar_url: author.avatar_url,
            bio: author.bio,
            likes_count: first_count(&self.likes),
            comments_count: first_count(&self.comments),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthorRow {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    bio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    #[serde(default)]
    count: u64,
}

fn first_count(rows: &[CountRow]) -> u64 {
    rows.first().map(|row| row.count).unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct CommentRow {
    id: String,
    post_id: String,
    user_id: String,
    content: String,
    #[serde(default)]
    parent_comment_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    profiles: Option<AuthorRow>,
}

impl CommentRow {
    fn into_comment(self) -> Comment {
        let author = self.profiles.unwrap_or_default();
        Comment {
            id: self.id,
            post_id: self.post_id,
            user_id: self.user_id,
            content: self.content,
            parent_comment_id: self.parent_comment_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            username: author
                .username
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNKNOWN_USERNAME.to_string()),
            avatar_url: author.avatar_url,
            provisional: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostIdRow {
    post_id: String,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}


#[cfg(test)]
mod tests {
    use super::testserver::serve;
    use super::*;

    struct FixedToken(&'static str);

    impl TokenProvider for FixedToken {
        fn access_token(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn client(base: &str, tokens: Arc<dyn TokenProvider>) -> Client {
        Client::new(
            tokens,
            ClientConfig {
                base_url: base.to_string(),
                anon_key: "anon".to_string(),
                user_agent: "parkfeed-test".to_string(),
                timeout: Some(Duration::from_secs(5)),
                http_client: None,
            },
        )
        .unwrap()
    }

    const FEED_PAGE: &str = r#"[
      {"id":"p2","user_id":"u1","image_url":"u1/p2.jpg","park_name":"Gir","caption":null,
       "latitude":null,"longitude":null,
       "created_at":"2024-05-02T10:00:00+00:00","updated_at":"2024-05-02T10:00:00+00:00",
       "profiles":{"username":"asha","avatar_url":"u1/avatar.jpg","bio":null},
       "likes":[{"count":3}],"comments":[{"count":1}]},
      {"id":"p1","user_id":"u2","image_url":"https://cdn.example/p1.jpg","park_name":"Corbett",
       "caption":"tiger!","latitude":29.5,"longitude":78.9,
       "created_at":"2024-05-01T10:00:00+00:00","updated_at":"2024-05-01T10:00:00+00:00",
       "profiles":null,"likes":[],"comments":[]}
    ]"#;

    #[test]
    fn posts_decode_and_mark_viewer_likes() {
        let (base, seen) = serve(vec![(200, FEED_PAGE), (200, r#"[{"post_id":"p1"}]"#)]);
        let client = client(&base, Arc::new(FixedToken("jwt")));

        let posts = client.posts("viewer", PageRange::new(10, 10)).unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].username, "asha");
        assert_eq!(posts[0].likes_count, 3);
        assert_eq!(posts[0].comments_count, 1);
        assert!(!posts[0].user_liked);
        assert_eq!(posts[1].username, UNKNOWN_USERNAME);
        assert_eq!(posts[1].likes_count, 0);
        assert!(posts[1].user_liked);

        let feed = seen.recv().unwrap();
        assert_eq!(feed.method, "GET");
        assert!(feed.url.starts_with("/rest/v1/posts?"));
        assert!(feed.url.contains("order=created_at.desc"));
        assert!(feed.url.contains("offset=10"));
        assert!(feed.url.contains("limit=10"));
        assert_eq!(feed.authorization.as_deref(), Some("Bearer jwt"));
        assert_eq!(feed.apikey.as_deref(), Some("anon"));

        let likes = seen.recv().unwrap();
        assert!(likes.url.starts_with("/rest/v1/likes?"));
        assert!(likes.url.contains("user_id=eq.viewer"));
    }

    #[test]
    fn failed_like_lookup_keeps_the_page() {
        let (base, seen) = serve(vec![
            (200, FEED_PAGE),
            (500, r#"{"message":"statement timeout"}"#),
        ]);
        let client = client(&base, Arc::new(FixedToken("jwt")));

        let posts = client.posts("viewer", PageRange::new(0, 10)).unwrap();
        assert_eq!(posts.len(), 2);
        assert!(posts.iter().all(|post| !post.user_liked));
        assert_eq!(posts[0].likes_count, 3);

        assert!(seen.recv().unwrap().url.starts_with("/rest/v1/posts?"));
        assert!(seen.recv().unwrap().url.starts_with("/rest/v1/likes?"));
    }

    #[test]
    fn empty_page_skips_like_lookup() {
        let (base, seen) = serve(vec![(200, "[]")]);
        let client = client(&base, Arc::new(AnonToken));
        let posts = client.posts("viewer", PageRange::new(0, 10)).unwrap();
        assert!(posts.is_empty());
        let req = seen.recv().unwrap();
        assert_eq!(req.authorization.as_deref(), Some("Bearer anon"));
        assert!(seen.try_recv().is_err());
    }

    #[test]
    fn unauthorized_status_maps_to_error() {
        let (base, _seen) = serve(vec![(401, r#"{"message":"JWT expired"}"#)]);
        let client = client(&base, Arc::new(AnonToken));
        let err = client.find_like("u1", "p1").unwrap_err();
        assert!(format!("{err:#}").contains("unauthorized"));
    }

    #[test]
    fn insert_comment_returns_new_id() {
        let (base, seen) = serve(vec![(201, r#"[{"id":"c42"}]"#)]);
        let client = client(&base, Arc::new(AnonToken));
        let id = client
            .insert_comment(&NewComment {
                user_id: "u1".into(),
                post_id: "p1".into(),
                content: "lovely".into(),
                parent_comment_id: None,
            })
            .unwrap();
        assert_eq!(id, "c42");
        let req = seen.recv().unwrap();
        assert_eq!(req.method, "POST");
        assert!(req.body.contains("\"content\":\"lovely\""));
    }

    #[test]
    fn root_comments_filter_on_null_parent() {
        let (base, seen) = serve(vec![(
            200,
            r#"[{"id":"c1","post_id":"p1","user_id":"u1","content":"hi","parent_comment_id":null,
                "created_at":"2024-05-01T10:00:00+00:00","updated_at":"2024-05-01T10:00:00+00:00",
                "profiles":{"username":"asha","avatar_url":null}}]"#,
        )]);
        let client = client(&base, Arc::new(AnonToken));
        let comments = client.comments("p1", None).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].username, "asha");
        let req = seen.recv().unwrap();
        assert!(req.url.contains("parent_comment_id=is.null"));
        assert!(req.url.contains("order=created_at.asc"));
    }

    #[test]
    fn rejects_missing_configuration() {
        let result = Client::new(Arc::new(AnonToken), ClientConfig::default());
        assert!(result.is_err());
    }
}
