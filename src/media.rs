use url::Url;

pub const POST_IMAGES_BUCKET: &str = "post-images";
pub const AVATARS_BUCKET: &str = "avatars";

/// Public object URL for `path` inside `bucket`. Pure string mapping, no
/// request is made.
pub fn public_url(base: &Url, bucket: &str, path: &str) -> String {
    let base = base.as_str().trim_end_matches('/');
    format!(
        "{}/storage/v1/object/public/{}/{}",
        base,
        bucket,
        path.trim_start_matches('/')
    )
}

/// Maps stored image paths to fetchable URLs.
#[derive(Debug, Clone)]
pub struct Resolver {
    base: Url,
    post_bucket: String,
    avatar_bucket: String,
}

impl Resolver {
    pub fn new(base: Url, post_bucket: impl Into<String>, avatar_bucket: impl Into<String>) -> Self {
        Self {
            base,
            post_bucket: post_bucket.into(),
            avatar_bucket: avatar_bucket.into(),
        }
    }

    pub fn with_default_buckets(base: Url) -> Self {
        Self::new(base, POST_IMAGES_BUCKET, AVATARS_BUCKET)
    }

    /// Post images may still hold a local `file://` URI when the upload was
    /// skipped, so those pass through along with absolute http(s) URLs.
    pub fn post_image_url(&self, path: Option<&str>) -> Option<String> {
        let path = path.map(str::trim).filter(|p| !p.is_empty())?;
        if path.starts_with("http") || path.starts_with("file://") {
            return Some(path.to_string());
        }
        Some(public_url(&self.base, &self.post_bucket, path))
    }

    pub fn avatar_url(&self, path: Option<&str>) -> Option<String> {
        let path = path.map(str::trim).filter(|p| !p.is_empty())?;
        if path.starts_with("http") {
            return Some(path.to_string());
        }
        Some(public_url(&self.base, &self.avatar_bucket, path))
    }
}
