use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use crate::model::{
    Comment, Like, NewComment, NewPost, PageRange, Post, Profile, ProfileUpdate, UserPost,
    UNKNOWN_USERNAME,
};
use crate::supabase;

pub trait PostService: Send + Sync {
    fn feed_page(&self, viewer: &str, range: PageRange) -> Result<Vec<Post>>;
    fn user_posts(&self, user_id: &str) -> Result<Vec<UserPost>>;
    fn create_post(&self, post: &NewPost) -> Result<()>;
    fn update_caption(&self, post_id: &str, caption: Option<&str>) -> Result<()>;
    fn delete_post(&self, post_id: &str) -> Result<()>;
}

pub trait LikeService: Send + Sync {
    fn find_like(&self, user_id: &str, post_id: &str) -> Result<Option<Like>>;
    fn insert_like(&self, user_id: &str, post_id: &str) -> Result<()>;
    fn delete_like(&self, user_id: &str, post_id: &str) -> Result<()>;
}

pub trait CommentService: Send + Sync {
    fn load_comments(&self, post_id: &str, parent: Option<&str>) -> Result<Vec<Comment>>;
    fn add_comment(&self, comment: &NewComment) -> Result<String>;
    fn delete_comment(&self, comment_id: &str) -> Result<()>;
}

pub trait ProfileService: Send + Sync {
    fn profile(&self, user_id: &str) -> Result<Option<Profile>>;
    fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<()>;
    fn upload_avatar(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
}

pub struct SupabasePostService {
    client: Arc<supabase::Client>,
}

impl SupabasePostService {
    pub fn new(client: Arc<supabase::Client>) -> Self {
        Self { client }
    }
}

impl PostService for SupabasePostService {
    fn feed_page(&self, viewer: &str, range: PageRange) -> Result<Vec<Post>> {
        self.client
            .posts(viewer, range)
            .context("fetch home feed")
    }

    fn user_posts(&self, user_id: &str) -> Result<Vec<UserPost>> {
        self.client.user_posts(user_id).context("fetch user posts")
    }

    fn create_post(&self, post: &NewPost) -> Result<()> {
        self.client.insert_post(post)
    }

    fn update_caption(&self, post_id: &str, caption: Option<&str>) -> Result<()> {
        self.client.update_post_caption(post_id, caption)
    }

    fn delete_post(&self, post_id: &str) -> Result<()> {
        self.client.delete_post(post_id)
    }
}

pub struct SupabaseLikeService {
    client: Arc<supabase::Client>,
}

impl SupabaseLikeService {
    pub fn new(client: Arc<supabase::Client>) -> Self {
        Self { client }
    }
}

impl LikeService for SupabaseLikeService {
    fn find_like(&self, user_id: &str, post_id: &str) -> Result<Option<Like>> {
        self.client.find_like(user_id, post_id)
    }

    fn insert_like(&self, user_id: &str, post_id: &str) -> Result<()> {
        self.client.insert_like(user_id, post_id)
    }

    fn delete_like(&self, user_id: &str, post_id: &str) -> Result<()> {
        self.client.delete_like(user_id, post_id)
    }
}

pub struct SupabaseCommentService {
    client: Arc<supabase::Client>,
}

impl SupabaseCommentService {
    pub fn new(client: Arc<supabase::Client>) -> Self {
        Self { client }
    }
}

impl CommentService for SupabaseCommentService {
    fn load_comments(&self, post_id: &str, parent: Option<&str>) -> Result<Vec<Comment>> {
        self.client
            .comments(post_id, parent)
            .context("fetch comments")
    }

    fn add_comment(&self, comment: &NewComment) -> Result<String> {
        self.client.insert_comment(comment)
    }

    fn delete_comment(&self, comment_id: &str) -> Result<()> {
        self.client.delete_comment(comment_id)
    }
}

pub struct SupabaseProfileService {
    client: Arc<supabase::Client>,
    avatar_bucket: String,
}

impl SupabaseProfileService {
    pub fn new(client: Arc<supabase::Client>, avatar_bucket: impl Into<String>) -> Self {
        Self {
            client,
            avatar_bucket: avatar_bucket.into(),
        }
    }
}

impl ProfileService for SupabaseProfileService {
    fn profile(&self, user_id: &str) -> Result<Option<Profile>> {
        self.client.profile(user_id).context("fetch profile")
    }

    fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<()> {
        self.client.update_profile(user_id, update)
    }

    fn upload_avatar(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .upload_object(&self.avatar_bucket, path, bytes, content_type)
    }
}

/// In-process stand-in for the hosted backend. Serves the offline demo
/// and the unit tests; enforces the same uniqueness the real tables do.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    posts: Vec<Post>,
    likes: Vec<Like>,
    comments: Vec<Comment>,
    profiles: HashMap<String, Profile>,
    uploads: HashMap<String, (Vec<u8>, String)>,
    next_id: u64,
    calls: usize,
    failing: bool,
}

impl MemoryState {
    fn call(&mut self) -> Result<()> {
        self.calls += 1;
        if self.failing {
            bail!("memory backend: connection refused");
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    fn username(&self, user_id: &str) -> (String, Option<String>, Option<String>) {
        match self.profiles.get(user_id) {
            Some(profile) => (
                profile.username.clone(),
                profile.avatar_url.clone(),
                profile.bio.clone(),
            ),
            None => (UNKNOWN_USERNAME.to_string(), None, None),
        }
    }

    fn hydrate(&self, post: &Post, viewer: &str) -> Post {
        let (username, avatar_url, bio) = self.username(&post.user_id);
        let mut post = post.clone();
        post.username = username;
        post.avatar_url = avatar_url;
        post.bio = bio;
        post.likes_count = self.likes.iter().filter(|l| l.post_id == post.id).count() as u64;
        post.comments_count = self
            .comments
            .iter()
            .filter(|c| c.post_id == post.id)
            .count() as u64;
        post.user_liked = self
            .likes
            .iter()
            .any(|l| l.post_id == post.id && l.user_id == viewer);
        post
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small seeded dataset used when no backend is configured.
    pub fn demo() -> Self {
        let backend = Self::new();
        let now = Utc::now();
        let parks = [
            ("Kaziranga", "One-horned rhinos at dawn"),
            ("Jim Corbett", "Tiger tracks by the Ramganga"),
            ("Gir", "Asiatic lions resting in the shade"),
            ("Valley of Flowers", "Monsoon bloom at 3,600 m"),
            ("Periyar", "Elephants crossing the lake"),
        ];
        for (user, name) in [("demo-ranger", "ranger"), ("demo-asha", "asha")] {
            backend.add_profile(Profile {
                id: user.to_string(),
                username: name.to_string(),
                bio: None,
                avatar_url: None,
                created_at: now,
                updated_at: now,
            });
        }
        for (idx, (park, caption)) in parks.iter().enumerate() {
            let author = if idx % 2 == 0 { "demo-ranger" } else { "demo-asha" };
            let created = now - Duration::hours(idx as i64 * 5);
            backend.add_post(Post {
                id: format!("demo-{}", idx + 1),
                user_id: author.to_string(),
                image_url: format!("{}/demo-{}.jpg", author, idx + 1),
                park_name: park.to_string(),
                caption: Some(caption.to_string()),
                latitude: None,
                longitude: None,
                created_at: created,
                updated_at: created,
                username: String::new(),
                avatar_url: None,
                bio: None,
                likes_count: 0,
                comments_count: 0,
                user_liked: false,
            });
        }
        {
            let mut state = backend.state.lock();
            state.likes.push(Like {
                id: Some("demo-like-1".into()),
                user_id: "demo-asha".into(),
                post_id: "demo-1".into(),
            });
            state.comments.push(Comment {
                id: "demo-comment-1".into(),
                post_id: "demo-1".into(),
                user_id: "demo-asha".into(),
                content: "Stunning light!".into(),
                parent_comment_id: None,
                created_at: now,
                updated_at: now,
                username: String::new(),
                avatar_url: None,
                provisional: false,
            });
        }
        backend
    }

    pub fn add_post(&self, post: Post) {
        self.state.lock().posts.push(post);
    }

    pub fn add_profile(&self, profile: Profile) {
        self.state.lock().profiles.insert(profile.id.clone(), profile);
    }

    pub fn add_comment_row(&self, comment: Comment) {
        self.state.lock().comments.push(comment);
    }

    /// Makes every subsequent call fail like an unreachable backend.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Number of gateway calls served so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    pub fn like_rows(&self, user_id: &str, post_id: &str) -> usize {
        self.state
            .lock()
            .likes
            .iter()
            .filter(|l| l.user_id == user_id && l.post_id == post_id)
            .count()
    }

    pub fn upload(&self, path: &str) -> Option<(Vec<u8>, String)> {
        self.state.lock().uploads.get(path).cloned()
    }
}

impl PostService for MemoryBackend {
    fn feed_page(&self, viewer: &str, range: PageRange) -> Result<Vec<Post>> {
        let mut state = self.state.lock();
        state.call()?;
        let mut ordered: Vec<&Post> = state.posts.iter().collect();
        ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ordered
            .into_iter()
            .skip(range.offset)
            .take(range.limit)
            .map(|post| state.hydrate(post, viewer))
            .collect())
    }

    fn user_posts(&self, user_id: &str) -> Result<Vec<UserPost>> {
        let mut state = self.state.lock();
        state.call()?;
        let mut posts: Vec<UserPost> = state
            .posts
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| UserPost {
                id: p.id.clone(),
                image_url: p.image_url.clone(),
                park_name: p.park_name.clone(),
                caption: p.caption.clone(),
                created_at: p.created_at,
            })
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(posts)
    }

    fn create_post(&self, post: &NewPost) -> Result<()> {
        let mut state = self.state.lock();
        state.call()?;
        let id = state.next_id("post-");
        let now = Utc::now();
        state.posts.push(Post {
            id,
            user_id: post.user_id.clone(),
            image_url: post.image_url.clone(),
            park_name: post.park_name.clone(),
            caption: post.caption.clone(),
            latitude: Some(post.latitude),
            longitude: Some(post.longitude),
            created_at: now,
            updated_at: now,
            username: String::new(),
            avatar_url: None,
            bio: None,
            likes_count: 0,
            comments_count: 0,
            user_liked: false,
        });
        Ok(())
    }

    fn update_caption(&self, post_id: &str, caption: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        state.call()?;
        let post = state
            .posts
            .iter_mut()
            .find(|p| p.id == post_id)
            .ok_or_else(|| anyhow!("memory backend: post {} not found", post_id))?;
        post.caption = caption.map(str::to_string);
        post.updated_at = Utc::now();
        Ok(())
    }

    fn delete_post(&self, post_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.call()?;
        state.posts.retain(|p| p.id != post_id);
        state.likes.retain(|l| l.post_id != post_id);
        state.comments.retain(|c| c.post_id != post_id);
        Ok(())
    }
}

impl LikeService for MemoryBackend {
    fn find_like(&self, user_id: &str, post_id: &str) -> Result<Option<Like>> {
        let mut state = self.state.lock();
        state.call()?;
        Ok(state
            .likes
            .iter()
            .find(|l| l.user_id == user_id && l.post_id == post_id)
            .cloned())
    }

    fn insert_like(&self, user_id: &str, post_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.call()?;
        if state
            .likes
            .iter()
            .any(|l| l.user_id == user_id && l.post_id == post_id)
        {
            bail!("memory backend: duplicate like for ({}, {})", user_id, post_id);
        }
        let id = state.next_id("like-");
        state.likes.push(Like {
            id: Some(id),
            user_id: user_id.to_string(),
            post_id: post_id.to_string(),
        });
        Ok(())
    }

    fn delete_like(&self, user_id: &str, post_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.call()?;
        state
            .likes
            .retain(|l| !(l.user_id == user_id && l.post_id == post_id));
        Ok(())
    }
}

impl CommentService for MemoryBackend {
    fn load_comments(&self, post_id: &str, parent: Option<&str>) -> Result<Vec<Comment>> {
        let mut state = self.state.lock();
        state.call()?;
        let mut comments: Vec<Comment> = state
            .comments
            .iter()
            .filter(|c| c.post_id == post_id && c.parent_comment_id.as_deref() == parent)
            .map(|c| {
                let (username, avatar_url, _) = state.username(&c.user_id);
                Comment {
                    username,
                    avatar_url,
                    ..c.clone()
                }
            })
            .collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }

    fn add_comment(&self, comment: &NewComment) -> Result<String> {
        let mut state = self.state.lock();
        state.call()?;
        let id = state.next_id("comment-");
        let now = Utc::now();
        state.comments.push(Comment {
            id: id.clone(),
            post_id: comment.post_id.clone(),
            user_id: comment.user_id.clone(),
            content: comment.content.clone(),
            parent_comment_id: comment.parent_comment_id.clone(),
            created_at: now,
            updated_at: now,
            username: String::new(),
            avatar_url: None,
            provisional: false,
        });
        Ok(id)
    }

    fn delete_comment(&self, comment_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.call()?;
        state.comments.retain(|c| c.id != comment_id);
        Ok(())
    }
}

impl ProfileService for MemoryBackend {
    fn profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let mut state = self.state.lock();
        state.call()?;
        Ok(state.profiles.get(user_id).cloned())
    }

    fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<()> {
        let mut state = self.state.lock();
        state.call()?;
        let profile = state
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| anyhow!("memory backend: profile {} not found", user_id))?;
        if let Some(username) = &update.username {
            profile.username = username.clone();
        }
        if let Some(bio) = &update.bio {
            profile.bio = bio.clone();
        }
        if let Some(avatar_url) = &update.avatar_url {
            profile.avatar_url = avatar_url.clone();
        }
        profile.updated_at = Utc::now();
        Ok(())
    }

    fn upload_avatar(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.call()?;
        state
            .uploads
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    #[test]
    fn feed_page_is_newest_first_and_sliced() {
        let backend = MemoryBackend::new();
        for (id, secs) in [("a", 10), ("b", 30), ("c", 20)] {
            backend.add_post(fixtures::post(id, secs));
        }
        let first = backend.feed_page("v", PageRange::new(0, 2)).unwrap();
        let ids: Vec<_> = first.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
        let rest = backend.feed_page("v", PageRange::new(2, 2)).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "a");
    }

    #[test]
    fn like_rows_are_unique_per_user_and_post() {
        let backend = MemoryBackend::new();
        backend.add_post(fixtures::post("p1", 0));
        backend.insert_like("v", "p1").unwrap();
        assert!(backend.insert_like("v", "p1").is_err());
        assert_eq!(backend.like_rows("v", "p1"), 1);

        let page = backend.feed_page("v", PageRange::new(0, 10)).unwrap();
        assert_eq!(page[0].likes_count, 1);
        assert!(page[0].user_liked);
        assert_eq!(page[0].username, UNKNOWN_USERNAME);
    }

    #[test]
    fn failing_backend_counts_calls() {
        let backend = MemoryBackend::new();
        backend.set_failing(true);
        assert!(backend.feed_page("v", PageRange::new(0, 10)).is_err());
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn demo_dataset_is_browsable() {
        let backend = MemoryBackend::demo();
        let page = backend.feed_page("demo-asha", PageRange::new(0, 10)).unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].id, "demo-1");
        assert!(page[0].user_liked);
        assert_eq!(page[0].comments_count, 1);
    }
}
