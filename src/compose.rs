use anyhow::{Context, Result};

use crate::data::PostService;
use crate::model::{non_blank, NewPost, ValidationError};
use crate::session::Session;

/// The create-post form. `image` is whatever reference the picker produced:
/// a storage path, an http(s) URL or a local `file://` URI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostDraft {
    pub image: Option<String>,
    pub title: String,
    pub description: String,
    pub coordinates: Option<(f64, f64)>,
}

impl PostDraft {
    pub fn new(image: Option<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            image,
            title: title.into(),
            description: description.into(),
            coordinates: None,
        }
    }

    /// Checks the form in the order it is shown: title, then image.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.image.as_deref().map_or(true, |image| image.trim().is_empty()) {
            return Err(ValidationError::MissingImage);
        }
        Ok(())
    }

    pub fn to_new_post(&self, user_id: &str) -> Result<NewPost, ValidationError> {
        self.validate()?;
        let (latitude, longitude) = self.coordinates.unwrap_or((0.0, 0.0));
        Ok(NewPost {
            user_id: user_id.to_string(),
            image_url: self.image.as_deref().unwrap_or_default().trim().to_string(),
            park_name: self.title.trim().to_string(),
            caption: non_blank(&self.description),
            latitude,
            longitude,
        })
    }
}

/// Creates a post for the session's user. Invalid drafts never reach the
/// backend.
pub fn submit(service: &dyn PostService, session: &Session, draft: &PostDraft) -> Result<()> {
    let post = draft.to_new_post(&session.user_id)?;
    service.create_post(&post).context("compose: create post")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryBackend;
    use crate::model::fixtures::at;
    use crate::model::PageRange;

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

    #[test]
    fn title_is_checked_before_image() {
        let draft = PostDraft::new(None, "  ", "");
        assert_eq!(draft.validate(), Err(ValidationError::EmptyTitle));
        let draft = PostDraft::new(None, "Gir", "");
        assert_eq!(draft.validate(), Err(ValidationError::MissingImage));
        let draft = PostDraft::new(Some(" ".into()), "Gir", "");
        assert_eq!(draft.validate(), Err(ValidationError::MissingImage));
    }

    #[test]
    fn invalid_draft_makes_no_request() {
        let backend = MemoryBackend::new();
        let err = submit(&backend, &session(), &PostDraft::new(None, "Gir", "")).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::MissingImage)
        );
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn draft_fields_are_trimmed() {
        let draft = PostDraft::new(Some("file:///tmp/a.jpg".into()), "  Gir  ", "   ");
        let post = draft.to_new_post("author").unwrap();
        assert_eq!(post.park_name, "Gir");
        assert_eq!(post.caption, None);
        assert_eq!((post.latitude, post.longitude), (0.0, 0.0));
        assert_eq!(post.image_url, "file:///tmp/a.jpg");

        let mut draft = PostDraft::new(Some("u1/a.jpg".into()), "Gir", " lions ");
        draft.coordinates = Some((21.1, 70.8));
        let post = draft.to_new_post("author").unwrap();
        assert_eq!(post.caption.as_deref(), Some("lions"));
        assert_eq!(post.latitude, 21.1);
    }

    #[test]
    fn submitted_post_shows_up_in_feed() {
        let backend = MemoryBackend::new();
        let draft = PostDraft::new(Some("author/new.jpg".into()), "Periyar", "boats");
        submit(&backend, &session(), &draft).unwrap();
        let page = backend.feed_page("author", PageRange::new(0, 10)).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].park_name, "Periyar");
        assert_eq!(page[0].caption.as_deref(), Some("boats"));
    }
}
