use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::data::LikeService;
use crate::model::Post;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeState {
    pub liked: bool,
    pub likes_count: u64,
}

impl LikeState {
    pub fn of(post: &Post) -> Self {
        Self {
            liked: post.user_liked,
            likes_count: post.likes_count,
        }
    }

    /// Moves to `liked`. The count only changes on an actual transition and
    /// never drops below zero.
    pub fn transition(self, liked: bool) -> Self {
        if self.liked == liked {
            return self;
        }
        let likes_count = if liked {
            self.likes_count.saturating_add(1)
        } else {
            self.likes_count.saturating_sub(1)
        };
        Self { liked, likes_count }
    }
}

/// Flips the viewer's like on a post and reports the resulting state.
///
/// This is a check-then-act sequence against the backend and is not atomic:
/// two toggles for the same (user, post) racing from different clients can
/// both observe the same state. The unique (user_id, post_id) constraint
/// keeps the row count at one or zero; whichever write lands last wins.
pub fn toggle_like(service: &dyn LikeService, user_id: &str, post_id: &str) -> Result<bool> {
    match service.find_like(user_id, post_id)? {
        Some(_) => {
            service.delete_like(user_id, post_id)?;
            Ok(false)
        }
        None => {
            service.insert_like(user_id, post_id)?;
            Ok(true)
        }
    }
}

/// Pure list update after a confirmed toggle. Order and every other post
/// are left untouched.
pub fn apply_like_change(posts: &[Post], post_id: &str, liked: bool) -> Vec<Post> {
    posts
        .iter()
        .map(|post| {
            if post.id == post_id {
                with_state(post, LikeState::of(post).transition(liked))
            } else {
                post.clone()
            }
        })
        .collect()
}

fn with_state(post: &Post, state: LikeState) -> Post {
    Post {
        user_liked: state.liked,
        likes_count: state.likes_count,
        ..post.clone()
    }
}

/// Local optimistic layer over the authoritative feed snapshot.
///
/// Entries are display hints only. [`Engagement::reset`] drops all of them
/// whenever a fresh snapshot replaces the list.
#[derive(Debug, Default)]
pub struct Engagement {
    overlay: HashMap<String, LikeState>,
    in_flight: HashSet<String>,
}

impl Engagement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, post: &Post) -> LikeState {
        self.overlay
            .get(&post.id)
            .copied()
            .unwrap_or_else(|| LikeState::of(post))
    }

    /// Claims the toggle slot for `post_id`. Returns false while an earlier
    /// toggle on the same post has not finished.
    pub fn begin_toggle(&mut self, post_id: &str) -> bool {
        if !self.in_flight.insert(post_id.to_string()) {
            log::debug!("engagement: toggle on {} ignored, one is in flight", post_id);
            return false;
        }
        true
    }

    pub fn is_toggling(&self, post_id: &str) -> bool {
        self.in_flight.contains(post_id)
    }

    /// Releases the toggle slot and, on success, records the confirmed state.
    /// A failed toggle leaves the displayed state as it was.
    pub fn finish_toggle(&mut self, post: &Post, result: Result<bool>) -> Result<LikeState> {
        self.in_flight.remove(&post.id);
        let liked = result?;
        Ok(self.record(post, liked))
    }

    pub fn record(&mut self, post: &Post, liked: bool) -> LikeState {
        let next = self.state_of(post).transition(liked);
        self.overlay.insert(post.id.clone(), next);
        next
    }

    pub fn overlay_onto(&self, posts: &[Post]) -> Vec<Post> {
        posts
            .iter()
            .map(|post| match self.overlay.get(&post.id) {
                Some(state) => with_state(post, *state),
                None => post.clone(),
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.overlay.clear();
    }

    pub fn len(&self) -> usize {
        self.overlay.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlay.is_empty()
    }
}
