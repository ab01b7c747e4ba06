use anyhow::Result;
use chrono::Utc;

use crate::data::CommentService;
use crate::model::{Comment, NewComment, ValidationError, COMMENT_MAX_CHARS};
use crate::session::Session;

/// Root-level comments of a post, oldest first. Errors are logged and read
/// as an empty thread.
pub fn load_comments(service: &dyn CommentService, post_id: &str) -> Vec<Comment> {
    match service.load_comments(post_id, None) {
        Ok(comments) => comments,
        Err(err) => {
            log::error!("comments: load {}: {:#}", post_id, err);
            Vec::new()
        }
    }
}

/// Direct replies to one comment. Only one reply level is modelled.
pub fn load_replies(service: &dyn CommentService, post_id: &str, parent_id: &str) -> Vec<Comment> {
    match service.load_comments(post_id, Some(parent_id)) {
        Ok(comments) => comments,
        Err(err) => {
            log::error!("comments: load replies to {}: {:#}", parent_id, err);
            Vec::new()
        }
    }
}

/// Returns the trimmed body, or why it cannot be posted.
pub fn validate_comment(content: &str, max_chars: usize) -> Result<String, ValidationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyComment);
    }
    if trimmed.chars().count() > max_chars {
        return Err(ValidationError::CommentTooLong { max: max_chars });
    }
    Ok(trimmed.to_string())
}

/// Inserts a root-level comment and returns its id. Invalid content is
/// rejected before any request is made.
pub fn post_comment(
    service: &dyn CommentService,
    user_id: &str,
    post_id: &str,
    content: &str,
) -> Result<String> {
    let content = validate_comment(content, COMMENT_MAX_CHARS)?;
    service.add_comment(&NewComment {
        user_id: user_id.to_string(),
        post_id: post_id.to_string(),
        content,
        parent_comment_id: None,
    })
}

/// Comment list for the one post whose comment sheet is open.
#[derive(Debug, Clone)]
pub struct CommentThread {
    post_id: String,
    max_chars: usize,
    comments: Vec<Comment>,
}

impl CommentThread {
    pub fn new(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            max_chars: COMMENT_MAX_CHARS,
            comments: Vec::new(),
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars.max(1);
        self
    }

    pub fn open(service: &dyn CommentService, post_id: impl Into<String>) -> Self {
        let mut thread = Self::new(post_id);
        thread.refresh(service);
        thread
    }

    pub fn post_id(&self) -> &str {
        &self.post_id
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    /// Replaces the list with the server's copy, which also drops any
    /// provisional entries.
    pub fn refresh(&mut self, service: &dyn CommentService) {
        self.comments = load_comments(service, &self.post_id);
    }

    /// Posts `content` as the session's user and appends a provisional copy
    /// without re-fetching. Its timestamps are the local clock's.
    pub fn submit(
        &mut self,
        service: &dyn CommentService,
        session: &Session,
        content: &str,
    ) -> Result<&Comment> {
        let content = validate_comment(content, self.max_chars)?;
        let id = service.add_comment(&NewComment {
            user_id: session.user_id.clone(),
            post_id: self.post_id.clone(),
            content: content.clone(),
            parent_comment_id: None,
        })?;
        let now = Utc::now();
        self.comments.push(Comment {
            id,
            post_id: self.post_id.clone(),
            user_id: session.user_id.clone(),
            content,
            parent_comment_id: None,
            created_at: now,
            updated_at: now,
            username: session.username.clone(),
            avatar_url: None,
            provisional: true,
        });
        let index = self.comments.len() - 1;
        Ok(&self.comments[index])
    }

    /// Deletes a comment remotely, then drops the local copy.
    pub fn delete(&mut self, service: &dyn CommentService, comment_id: &str) -> Result<()> {
        service.delete_comment(comment_id)?;
        self.comments.retain(|comment| comment.id != comment_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryBackend;
    use crate::model::fixtures::{at, comment};

    fn session() -> Session {
        Session {
            user_id: "viewer".into(),
            email: "viewer@example.com".into(),
            username: "viewer_name".into(),
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: at(3600),
        }
    }

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_comment_row(comment("c2", "P1", 20));
        backend.add_comment_row(comment("c1", "P1", 10));
        let mut reply = comment("r1", "P1", 30);
        reply.parent_comment_id = Some("c1".into());
        backend.add_comment_row(reply);
        backend.add_comment_row(comment("other", "P2", 5));
        backend
    }

    #[test]
    fn whitespace_comment_is_rejected_without_a_request() {
        let backend = MemoryBackend::new();
        let err = post_comment(&backend, "viewer", "P1", "  \n\t ").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::EmptyComment)
        );
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn overlong_comment_is_rejected() {
        let body = "a".repeat(COMMENT_MAX_CHARS + 1);
        assert_eq!(
            validate_comment(&body, COMMENT_MAX_CHARS),
            Err(ValidationError::CommentTooLong { max: COMMENT_MAX_CHARS })
        );
        let exact = "é".repeat(COMMENT_MAX_CHARS);
        assert!(validate_comment(&exact, COMMENT_MAX_CHARS).is_ok());
    }

    #[test]
    fn post_comment_trims_and_returns_id() {
        let backend = MemoryBackend::new();
        let id = post_comment(&backend, "viewer", "P1", "  nice shot  ").unwrap();
        let stored = load_comments(&backend, "P1");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].content, "nice shot");
    }

    #[test]
    fn only_root_comments_load_in_ascending_order() {
        let backend = seeded();
        let ids: Vec<_> = load_comments(&backend, "P1").into_iter().map(|c| c.id).collect();
        assert_eq!(ids, ["c1", "c2"]);
        let replies = load_replies(&backend, "P1", "c1");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, "r1");
    }

    #[test]
    fn load_errors_read_as_empty_thread() {
        let backend = seeded();
        backend.set_failing(true);
        assert!(load_comments(&backend, "P1").is_empty());
        assert!(load_replies(&backend, "P1", "c1").is_empty());
    }

    #[test]
    fn submit_appends_provisional_comment() {
        let backend = seeded();
        let mut thread = CommentThread::open(&backend, "P1");
        assert_eq!(thread.len(), 2);
        let calls = backend.calls();

        let added = thread.submit(&backend, &session(), " hello ").unwrap().clone();
        assert!(added.provisional);
        assert_eq!(added.username, "viewer_name");
        assert_eq!(added.content, "hello");
        assert!(added.is_root());
        // One insert, no re-fetch.
        assert_eq!(backend.calls(), calls + 1);
        assert_eq!(thread.comments().last().map(|c| c.id.as_str()), Some(added.id.as_str()));

        thread.refresh(&backend);
        assert_eq!(thread.len(), 3);
        assert!(thread.comments().iter().all(|c| !c.provisional));
    }

    #[test]
    fn failed_submit_leaves_thread_untouched() {
        let backend = seeded();
        let mut thread = CommentThread::open(&backend, "P1");
        backend.set_failing(true);
        assert!(thread.submit(&backend, &session(), "hello").is_err());
        assert!(thread.submit(&backend, &session(), "   ").is_err());
        assert_eq!(thread.len(), 2);
    }

    #[test]
    fn thread_limit_is_configurable() {
        let backend = MemoryBackend::new();
        let mut thread = CommentThread::new("P1").with_max_chars(5);
        let err = thread.submit(&backend, &session(), "too long").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::CommentTooLong { max: 5 })
        );
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn delete_removes_local_copy() {
        let backend = seeded();
        let mut thread = CommentThread::open(&backend, "P1");
        thread.delete(&backend, "c1").unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(load_comments(&backend, "P1").len(), 1);
    }
}
