use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::data::{LikeService, PostService};
use crate::engagement::{self, Engagement, LikeState};
use crate::model::{PageRange, Post, DEFAULT_PAGE_SIZE};

/// Fetches one page of the feed. Transport and query errors are logged and
/// read as an empty page, which the caller treats as "no more data".
pub fn load_page(
    service: &dyn PostService,
    viewer: &str,
    page_size: usize,
    offset: usize,
) -> Vec<Post> {
    dedup(fetch_rows(service, viewer, PageRange::new(offset, page_size)))
}

/// Rows exactly as the backend returned them. [`Feed::complete`] needs the
/// raw length to advance the cursor.
fn fetch_rows(service: &dyn PostService, viewer: &str, range: PageRange) -> Vec<Post> {
    match service.feed_page(viewer, range) {
        Ok(rows) => rows,
        Err(err) => {
            log::error!("feed: load page at offset {}: {:#}", range.offset, err);
            Vec::new()
        }
    }
}

/// Appends `page` to `existing`, dropping any post whose id is already
/// present. No re-sort: pages arrive pre-sorted from the backend.
pub fn append_page(mut existing: Vec<Post>, page: Vec<Post>) -> Vec<Post> {
    let mut seen: HashSet<String> = existing.iter().map(|post| post.id.clone()).collect();
    existing.extend(page.into_iter().filter(|post| seen.insert(post.id.clone())));
    existing
}

/// A short page means the backend ran out of rows. A full last page costs
/// one extra, empty fetch.
pub fn has_more(page_len: usize, page_size: usize) -> bool {
    page_len >= page_size
}

fn dedup(page: Vec<Post>) -> Vec<Post> {
    append_page(Vec::new(), page)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Replace,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub request_id: u64,
    pub mode: LoadMode,
    pub range: PageRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Replaced { count: usize },
    Appended { added: usize, skipped: usize },
    /// The response belonged to a request that was superseded.
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    request_id: u64,
    mode: LoadMode,
}

/// Ordered, de-duplicated feed owned by one screen.
///
/// Offsets follow the backend's cursor: a reset sets the offset to the
/// number of posts fetched, an append advances it by the number fetched
/// (not the number kept after de-duplication).
#[derive(Debug)]
pub struct Feed {
    page_size: usize,
    posts: Vec<Post>,
    offset: usize,
    has_more: bool,
    pending: Option<Pending>,
    next_request_id: u64,
    engagement: Engagement,
}

impl Default for Feed {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl Feed {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            posts: Vec::new(),
            offset: 0,
            has_more: true,
            pending: None,
            next_request_id: 1,
            engagement: Engagement::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// The last authoritative snapshot, without local like hints.
    pub fn snapshot(&self) -> &[Post] {
        &self.posts
    }

    /// Posts as they should be displayed: the snapshot with optimistic like
    /// state laid over it.
    pub fn visible(&self) -> Vec<Post> {
        self.engagement.overlay_onto(&self.posts)
    }

    pub fn engagement(&self) -> &Engagement {
        &self.engagement
    }

    /// Starts a reset. Rejected while another reset is in flight; an
    /// in-flight append is superseded and its result will come back stale.
    pub fn begin_refresh(&mut self) -> Option<PageRequest> {
        if let Some(pending) = self.pending {
            if pending.mode == LoadMode::Replace {
                log::debug!("feed: refresh ignored, request {} in flight", pending.request_id);
                return None;
            }
            log::debug!("feed: refresh supersedes append {}", pending.request_id);
        }
        Some(self.issue(LoadMode::Replace, 0))
    }

    /// Starts an append at the current offset. Rejected while anything is
    /// in flight or once the feed is exhausted.
    pub fn begin_load_more(&mut self) -> Option<PageRequest> {
        if self.pending.is_some() || !self.has_more {
            return None;
        }
        Some(self.issue(LoadMode::Append, self.offset))
    }

    fn issue(&mut self, mode: LoadMode, offset: usize) -> PageRequest {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.pending = Some(Pending { request_id, mode });
        PageRequest {
            request_id,
            mode,
            range: PageRange::new(offset, self.page_size),
        }
    }

    /// Applies the rows fetched for `request_id`. `page` must be the backend's
    /// rows before de-duplication; the cursor and has-more follow its length.
    /// Pages for any request other than the one currently pending are
    /// discarded.
    pub fn complete(&mut self, request_id: u64, page: Vec<Post>) -> PageOutcome {
        let pending = match self.pending {
            Some(pending) if pending.request_id == request_id => pending,
            _ => {
                log::debug!("feed: discarding stale page for request {}", request_id);
                return PageOutcome::Stale;
            }
        };
        self.pending = None;

        let fetched = page.len();
        self.has_more = has_more(fetched, self.page_size);
        match pending.mode {
            LoadMode::Replace => {
                self.posts = dedup(page);
                self.offset = fetched;
                self.engagement.reset();
                PageOutcome::Replaced {
                    count: self.posts.len(),
                }
            }
            LoadMode::Append => {
                let before = self.posts.len();
                self.posts = append_page(std::mem::take(&mut self.posts), page);
                self.offset += fetched;
                let added = self.posts.len() - before;
                let skipped = fetched - added;
                if skipped > 0 {
                    log::debug!(
                        "feed: skipped {} duplicate post{}",
                        skipped,
                        if skipped == 1 { "" } else { "s" }
                    );
                }
                PageOutcome::Appended { added, skipped }
            }
        }
    }

    /// Pull-to-refresh: replaces the whole list with the first page.
    pub fn refresh(&mut self, service: &dyn PostService, viewer: &str) -> Option<PageOutcome> {
        let request = self.begin_refresh()?;
        let page = fetch_rows(service, viewer, request.range);
        Some(self.complete(request.request_id, page))
    }

    pub fn load_more(&mut self, service: &dyn PostService, viewer: &str) -> Option<PageOutcome> {
        let request = self.begin_load_more()?;
        let page = fetch_rows(service, viewer, request.range);
        Some(self.complete(request.request_id, page))
    }

    /// Toggles the viewer's like and records the confirmed state locally.
    /// Returns `Ok(None)` when the post is unknown or a toggle on it is
    /// already running.
    pub fn toggle_like(
        &mut self,
        service: &dyn LikeService,
        viewer: &str,
        post_id: &str,
    ) -> Result<Option<LikeState>> {
        let Some(post) = self.posts.iter().find(|post| post.id == post_id).cloned() else {
            return Ok(None);
        };
        if !self.engagement.begin_toggle(post_id) {
            return Ok(None);
        }
        let result = engagement::toggle_like(service, viewer, post_id);
        self.engagement.finish_toggle(&post, result).map(Some)
    }
}

struct PageResponse {
    request_id: u64,
    posts: Vec<Post>,
}

/// Runs page fetches on worker threads and feeds the results back into a
/// [`Feed`] through [`Loader::poll`] or [`Loader::wait`].
pub struct Loader {
    feed: Feed,
    service: Arc<dyn PostService>,
    tx: Sender<PageResponse>,
    rx: Receiver<PageResponse>,
}

impl Loader {
    pub fn new(service: Arc<dyn PostService>, page_size: usize) -> Self {
        let (tx, rx) = unbounded();
        Self {
            feed: Feed::new(page_size),
            service,
            tx,
            rx,
        }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut Feed {
        &mut self.feed
    }

    /// Returns false when the re-entrancy guard rejected the request.
    pub fn refresh(&mut self, viewer: &str) -> bool {
        match self.feed.begin_refresh() {
            Some(request) => {
                self.spawn(request, viewer);
                true
            }
            None => false,
        }
    }

    pub fn load_more(&mut self, viewer: &str) -> bool {
        match self.feed.begin_load_more() {
            Some(request) => {
                self.spawn(request, viewer);
                true
            }
            None => false,
        }
    }

    fn spawn(&self, request: PageRequest, viewer: &str) {
        let tx = self.tx.clone();
        let service = Arc::clone(&self.service);
        let viewer = viewer.to_string();
        thread::spawn(move || {
            let posts = fetch_rows(service.as_ref(), &viewer, request.range);
            let response = PageResponse {
                request_id: request.request_id,
                posts,
            };
            if tx.send(response).is_err() {
                log::debug!(
                    "feed: loader dropped, page for request {} lost",
                    request.request_id
                );
            }
        });
    }

    /// Applies every response that has already arrived.
    pub fn poll(&mut self) -> Vec<PageOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(response) = self.rx.try_recv() {
            outcomes.push(self.feed.complete(response.request_id, response.posts));
        }
        outcomes
    }

    /// Blocks until the pending request resolves or `timeout` passes.
    /// Stale responses received meanwhile are dropped.
    pub fn wait(&mut self, timeout: Duration) -> Option<PageOutcome> {
        let deadline = Instant::now() + timeout;
        while self.feed.is_loading() {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match self.rx.recv_timeout(remaining) {
                Ok(response) => {
                    let outcome = self.feed.complete(response.request_id, response.posts);
                    if outcome != PageOutcome::Stale {
                        return Some(outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        None
    }
}
