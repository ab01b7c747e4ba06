use anyhow::{Context, Result};

use crate::data::{PostService, ProfileService};
use crate::model::{non_blank, Profile, ProfileUpdate, UserPost, ValidationError};
use crate::session::Session;

const AVATAR_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "heic"];

pub fn fetch_profile(service: &dyn ProfileService, user_id: &str) -> Option<Profile> {
    match service.profile(user_id) {
        Ok(profile) => profile,
        Err(err) => {
            log::error!("profile: fetch {}: {:#}", user_id, err);
            None
        }
    }
}

impl ProfileUpdate {
    /// Builds an update from the edit-profile form. A blank username keeps
    /// the current one; a blank bio clears it.
    pub fn from_form(
        current: Option<&Profile>,
        username_input: &str,
        bio_input: &str,
    ) -> Result<Self, ValidationError> {
        let username = non_blank(username_input)
            .or_else(|| current.map(|p| p.username.clone()).filter(|u| !u.is_empty()))
            .ok_or(ValidationError::EmptyUsername)?;
        Ok(Self {
            username: Some(username),
            bio: Some(non_blank(bio_input)),
            avatar_url: None,
        })
    }
}

pub fn update_profile(
    service: &dyn ProfileService,
    session: &Session,
    update: &ProfileUpdate,
) -> Result<()> {
    service
        .update_profile(&session.user_id, update)
        .context("profile: update")
}

/// Storage path and content type for an avatar with the given file
/// extension.
pub fn avatar_object(user_id: &str, extension: &str) -> Result<(String, String), ValidationError> {
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    let ext = if ext.is_empty() { "jpg".to_string() } else { ext };
    if !AVATAR_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ValidationError::UnsupportedImage(ext));
    }
    let content_type = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        other => format!("image/{}", other),
    };
    Ok((format!("{}/avatar.{}", user_id, ext), content_type))
}

/// Uploads a new avatar and points the profile at it. Returns the storage
/// path.
pub fn upload_avatar(
    service: &dyn ProfileService,
    session: &Session,
    bytes: Vec<u8>,
    extension: &str,
) -> Result<String> {
    let (path, content_type) = avatar_object(&session.user_id, extension)?;
    service
        .upload_avatar(&path, bytes, &content_type)
        .context("profile: upload avatar")?;
    let update = ProfileUpdate {
        avatar_url: Some(Some(path.clone())),
        ..ProfileUpdate::default()
    };
    update_profile(service, session, &update)?;
    Ok(path)
}

/// A user's own post grid.
#[derive(Debug, Clone, Default)]
pub struct UserPosts {
    user_id: String,
    posts: Vec<UserPost>,
}

impl UserPosts {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            posts: Vec::new(),
        }
    }

    pub fn posts(&self) -> &[UserPost] {
        &self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn load(&mut self, service: &dyn PostService) {
        self.posts = match service.user_posts(&self.user_id) {
            Ok(posts) => posts,
            Err(err) => {
                log::error!("profile: load posts of {}: {:#}", self.user_id, err);
                Vec::new()
            }
        };
    }

    pub fn edit_caption(&mut self, service: &dyn PostService, post_id: &str, caption: &str) -> Result<()> {
        let caption = non_blank(caption);
        service
            .update_caption(post_id, caption.as_deref())
            .context("profile: update caption")?;
        if let Some(post) = self.posts.iter_mut().find(|p| p.id == post_id) {
            post.caption = caption;
        }
        Ok(())
    }

    pub fn delete(&mut self, service: &dyn PostService, post_id: &str) -> Result<()> {
        service.delete_post(post_id).context("profile: delete post")?;
        self.posts.retain(|p| p.id != post_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryBackend;
    use crate::model::fixtures::{at, post};

    fn session() -> Session {
        Session {
            user_id: "author".into(),
            email: "author@example.com".into(),
            username: "ranger".into(),
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: at(3600),
        }
    }

    fn profile(username: &str) -> Profile {
        Profile {
            id: "author".into(),
            username: username.into(),
            bio: Some("old bio".into()),
            avatar_url: None,
            created_at: at(0),
            updated_at: at(0),
        }
    }

    #[test]
    fn form_falls_back_to_current_username() {
        let current = profile("ranger");
        let update = ProfileUpdate::from_form(Some(&current), "   ", "  ").unwrap();
        assert_eq!(update.username.as_deref(), Some("ranger"));
        assert_eq!(update.bio, Some(None));
        assert_eq!(update.avatar_url, None);

        let update = ProfileUpdate::from_form(Some(&current), " asha ", " hi ").unwrap();
        assert_eq!(update.username.as_deref(), Some("asha"));
        assert_eq!(update.bio, Some(Some("hi".into())));
    }

    #[test]
    fn form_without_any_username_is_rejected() {
        assert_eq!(
            ProfileUpdate::from_form(None, " ", "bio"),
            Err(ValidationError::EmptyUsername)
        );
    }

    #[test]
    fn update_and_fetch_profile() {
        let backend = MemoryBackend::new();
        backend.add_profile(profile("ranger"));
        let update = ProfileUpdate::from_form(None, "asha", "").unwrap();
        update_profile(&backend, &session(), &update).unwrap();
        let stored = fetch_profile(&backend, "author").unwrap();
        assert_eq!(stored.username, "asha");
        assert_eq!(stored.bio, None);
        assert_eq!(fetch_profile(&backend, "nobody"), None);
    }

    #[test]
    fn fetch_errors_read_as_missing() {
        let backend = MemoryBackend::new();
        backend.add_profile(profile("ranger"));
        backend.set_failing(true);
        assert_eq!(fetch_profile(&backend, "author"), None);
    }

    #[test]
    fn avatar_paths_and_content_types() {
        assert_eq!(
            avatar_object("u1", "JPG").unwrap(),
            ("u1/avatar.jpg".to_string(), "image/jpeg".to_string())
        );
        assert_eq!(
            avatar_object("u1", ".png").unwrap(),
            ("u1/avatar.png".to_string(), "image/png".to_string())
        );
        assert_eq!(avatar_object("u1", "").unwrap().0, "u1/avatar.jpg");
        assert_eq!(
            avatar_object("u1", "exe"),
            Err(ValidationError::UnsupportedImage("exe".into()))
        );
    }

    #[test]
    fn upload_avatar_stores_object_and_updates_profile() {
        let backend = MemoryBackend::new();
        backend.add_profile(profile("ranger"));
        let path = upload_avatar(&backend, &session(), vec![1, 2, 3], "webp").unwrap();
        assert_eq!(path, "author/avatar.webp");
        assert_eq!(
            backend.upload(&path),
            Some((vec![1, 2, 3], "image/webp".to_string()))
        );
        assert_eq!(
            fetch_profile(&backend, "author").unwrap().avatar_url.as_deref(),
            Some("author/avatar.webp")
        );
    }

    #[test]
    fn unsupported_avatar_makes_no_request() {
        let backend = MemoryBackend::new();
        assert!(upload_avatar(&backend, &session(), vec![0], "bmp").is_err());
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn own_posts_grid_edits_and_deletes() {
        let backend = MemoryBackend::new();
        backend.add_post(post("p1", 10));
        backend.add_post(post("p2", 20));
        let mut other = post("p3", 30);
        other.user_id = "someone".into();
        backend.add_post(other);

        let mut grid = UserPosts::new("author");
        grid.load(&backend);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.posts()[0].id, "p2");

        grid.edit_caption(&backend, "p1", "  misty morning ").unwrap();
        let p1 = grid.posts().iter().find(|p| p.id == "p1").unwrap();
        assert_eq!(p1.caption.as_deref(), Some("misty morning"));

        grid.delete(&backend, "p2").unwrap();
        assert_eq!(grid.len(), 1);
        grid.load(&backend);
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn failed_delete_keeps_local_copy() {
        let backend = MemoryBackend::new();
        backend.add_post(post("p1", 10));
        let mut grid = UserPosts::new("author");
        grid.load(&backend);
        backend.set_failing(true);
        assert!(grid.delete(&backend, "p1").is_err());
        assert_eq!(grid.len(), 1);
    }
}
