use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const COMMENT_MAX_CHARS: usize = 500;
pub const UNKNOWN_USERNAME: &str = "Unknown User";

/// A feed post as seen by one viewer.
///
/// `likes_count`, `comments_count` and `user_liked` are derived by the
/// backend at fetch time; the author fields are denormalized from the
/// author's profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub image_url: String,
    pub park_name: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub likes_count: u64,
    #[serde(default)]
    pub comments_count: u64,
    #[serde(default)]
    pub user_liked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub parent_comment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Set on records synthesized locally after a successful insert. The
    /// timestamps of such a record are client clock readings, not the
    /// server's.
    #[serde(skip)]
    pub provisional: bool,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        self.parent_comment_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bio: Option<String>,
    /// Storage path inside the avatars bucket, not a full URL.
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Like {
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    pub post_id: String,
}

/// Post summary shown in a profile's post grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPost {
    pub id: String,
    pub image_url: String,
    pub park_name: String,
    #[serde(default)]
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPost {
    pub user_id: String,
    pub image_url: String,
    pub park_name: String,
    pub caption: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewComment {
    pub user_id: String,
    pub post_id: String,
    pub content: String,
    pub parent_comment_id: Option<String>,
}

/// Partial profile update. `None` leaves a column untouched; `Some(None)`
/// clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<Option<String>>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.bio.is_none() && self.avatar_url.is_none()
    }
}

/// Half-open `[offset, offset + limit)` slice of an ordered collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRange {
    pub offset: usize,
    pub limit: usize,
}

impl PageRange {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.max(1),
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.limit
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("comment is empty")]
    EmptyComment,
    #[error("comment is longer than {max} characters")]
    CommentTooLong { max: usize },
    #[error("please add a title")]
    EmptyTitle,
    #[error("please select an image")]
    MissingImage,
    #[error("username is required")]
    EmptyUsername,
    #[error("unsupported image type {0:?}")]
    UnsupportedImage(String),
}

/// Trims `input`, returning `None` when nothing is left.
pub fn non_blank(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
