use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use env_logger::Env;
use url::Url;

use crate::auth;
use crate::comments;
use crate::config::{self, Config};
use crate::data::{
    self, CommentService, LikeService, MemoryBackend, PostService, ProfileService,
};
use crate::feed::Loader;
use crate::media::Resolver;
use crate::model::Post;
use crate::profile::{self, UserPosts};
use crate::session;
use crate::storage;
use crate::supabase::{self, TokenProvider};

const DEMO_BASE_URL: &str = "https://demo.parkfeed.invalid/";

/// One invocation of the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { email: String },
    Logout,
    Feed { pages: usize },
    Comments { post_id: String },
    Comment { post_id: String, content: String },
    Like { post_id: String },
    Profile { user_id: Option<String> },
}

impl Command {
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);
        let name = args.next().unwrap_or_else(|| "feed".to_string());
        let rest: Vec<String> = args.collect();
        let command = match name.as_str() {
            "login" => match rest.as_slice() {
                [email] => Command::Login {
                    email: email.clone(),
                },
                _ => bail!("usage: parkfeed login <email>"),
            },
            "logout" => Command::Logout,
            "feed" => match rest.as_slice() {
                [] => Command::Feed { pages: 1 },
                [pages] => match pages.parse::<usize>() {
                    Ok(pages) if pages > 0 => Command::Feed { pages },
                    _ => bail!("feed: page count must be a positive number, got {:?}", pages),
                },
                _ => bail!("usage: parkfeed feed [pages]"),
            },
            "comments" => match rest.as_slice() {
                [post_id] => Command::Comments {
                    post_id: post_id.clone(),
                },
                _ => bail!("usage: parkfeed comments <post-id>"),
            },
            "comment" => match rest.split_first() {
                Some((post_id, words)) if !words.is_empty() => Command::Comment {
                    post_id: post_id.clone(),
                    content: words.join(" "),
                },
                _ => bail!("usage: parkfeed comment <post-id> <text>"),
            },
            "like" => match rest.as_slice() {
                [post_id] => Command::Like {
                    post_id: post_id.clone(),
                },
                _ => bail!("usage: parkfeed like <post-id>"),
            },
            "profile" => match rest.as_slice() {
                [] => Command::Profile { user_id: None },
                [user_id] => Command::Profile {
                    user_id: Some(user_id.clone()),
                },
                _ => bail!("usage: parkfeed profile [user-id]"),
            },
            other => bail!("unknown command {:?}; see --help", other),
        };
        Ok(command)
    }
}

/// Gateway services the commands run against.
pub struct Services {
    pub posts: Arc<dyn PostService>,
    pub likes: Arc<dyn LikeService>,
    pub comments: Arc<dyn CommentService>,
    pub profiles: Arc<dyn ProfileService>,
    pub auth: Option<auth::Client>,
    pub resolver: Resolver,
}

impl Services {
    /// Offline services backed by the seeded in-memory dataset.
    pub fn demo(cfg: &Config) -> Result<Self> {
        let backend = Arc::new(MemoryBackend::demo());
        let base = Url::parse(DEMO_BASE_URL)?;
        Ok(Self {
            posts: backend.clone(),
            likes: backend.clone(),
            comments: backend.clone(),
            profiles: backend,
            auth: None,
            resolver: Resolver::new(base, &cfg.buckets.post_images, &cfg.buckets.avatars),
        })
    }

    pub fn remote(cfg: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let user_agent = format!("parkfeed/{}", crate::VERSION);
        let client = Arc::new(
            supabase::Client::new(
                tokens,
                supabase::ClientConfig {
                    base_url: cfg.backend.url.clone(),
                    anon_key: cfg.backend.anon_key.clone(),
                    user_agent: user_agent.clone(),
                    timeout: Some(cfg.backend.timeout),
                    http_client: None,
                },
            )
            .context("app: build gateway client")?,
        );
        let auth = auth::Client::new(auth::Config {
            base_url: cfg.backend.url.clone(),
            anon_key: cfg.backend.anon_key.clone(),
            user_agent,
            timeout: cfg.backend.timeout,
        })
        .context("app: build auth client")?;
        let resolver = Resolver::new(
            client.base_url().clone(),
            &cfg.buckets.post_images,
            &cfg.buckets.avatars,
        );
        Ok(Self {
            posts: Arc::new(data::SupabasePostService::new(client.clone())),
            likes: Arc::new(data::SupabaseLikeService::new(client.clone())),
            comments: Arc::new(data::SupabaseCommentService::new(client.clone())),
            profiles: Arc::new(data::SupabaseProfileService::new(
                client,
                cfg.buckets.avatars.clone(),
            )),
            auth: Some(auth),
            resolver,
        })
    }
}

pub struct App {
    cfg: Config,
    sessions: Arc<session::Manager>,
    services: Services,
}

impl App {
    pub fn new(cfg: Config, sessions: Arc<session::Manager>, services: Services) -> Self {
        Self {
            cfg,
            sessions,
            services,
        }
    }

    pub fn execute(
        &self,
        command: Command,
        input: &mut dyn BufRead,
        out: &mut dyn Write,
    ) -> Result<()> {
        self.refresh_session();
        match command {
            Command::Login { email } => self.login(&email, input, out),
            Command::Logout => {
                self.sessions.sign_out(self.services.auth.as_ref())?;
                writeln!(out, "signed out")?;
                Ok(())
            }
            Command::Feed { pages } => self.print_feed(pages, out),
            Command::Comments { post_id } => self.print_comments(&post_id, out),
            Command::Comment { post_id, content } => {
                let session = self.sessions.require()?;
                let mut thread = comments::CommentThread::new(post_id)
                    .with_max_chars(self.cfg.feed.comment_max_chars);
                let added = thread.submit(self.services.comments.as_ref(), &session, &content)?;
                writeln!(out, "commented {}", added.id)?;
                Ok(())
            }
            Command::Like { post_id } => self.like(&post_id, out),
            Command::Profile { user_id } => self.print_profile(user_id, out),
        }
    }

    fn refresh_session(&self) {
        let Some(client) = self.services.auth.as_ref() else {
            return;
        };
        if let Err(err) = self
            .sessions
            .refresh_if_expiring(client, chrono::Duration::seconds(60))
        {
            log::warn!("app: session refresh failed: {:#}", err);
        }
    }

    fn viewer(&self) -> String {
        self.sessions
            .active()
            .map(|s| s.user_id)
            .unwrap_or_default()
    }

    fn login(&self, email: &str, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<()> {
        let Some(client) = self.services.auth.as_ref() else {
            bail!("app: no backend configured; set backend.url and backend.anon_key first");
        };
        let mut password = String::new();
        input
            .read_line(&mut password)
            .context("app: read password")?;
        let password = password.trim_end_matches(['\r', '\n']);
        let session = self.sessions.sign_in(client, email, password)?;
        writeln!(out, "signed in as @{}", session.username)?;
        Ok(())
    }

    fn print_feed(&self, pages: usize, out: &mut dyn Write) -> Result<()> {
        let viewer = self.viewer();
        let wait = self.cfg.backend.timeout + std::time::Duration::from_secs(1);
        let mut loader = Loader::new(self.services.posts.clone(), self.cfg.feed.page_size);

        loader.refresh(&viewer);
        let mut outcome = loader.wait(wait);
        for _ in 1..pages {
            if !loader.load_more(&viewer) {
                break;
            }
            outcome = loader.wait(wait);
        }
        if outcome.is_none() {
            log::warn!("app: feed request timed out");
        } else if loader.feed().has_more() {
            log::debug!("app: more posts after offset {}", loader.feed().offset());
        }

        let posts = loader.feed().visible();
        if posts.is_empty() {
            writeln!(out, "no posts")?;
        }
        for post in &posts {
            writeln!(out, "{}", feed_line(post))?;
        }
        Ok(())
    }

    fn print_comments(&self, post_id: &str, out: &mut dyn Write) -> Result<()> {
        let thread = comments::CommentThread::open(self.services.comments.as_ref(), post_id);
        if thread.is_empty() {
            writeln!(out, "no comments")?;
        }
        for comment in thread.comments() {
            writeln!(
                out,
                "@{} · {} · {}",
                comment.username,
                comment.created_at.format("%Y-%m-%d %H:%M"),
                comment.content
            )?;
        }
        Ok(())
    }

    fn like(&self, post_id: &str, out: &mut dyn Write) -> Result<()> {
        let session = self.sessions.require()?;
        let mut loader = Loader::new(self.services.posts.clone(), self.cfg.feed.page_size);
        let wait = self.cfg.backend.timeout + std::time::Duration::from_secs(1);
        loader.refresh(&session.user_id);
        loader.wait(wait);
        while !loader.feed().snapshot().iter().any(|p| p.id == post_id) {
            if !loader.load_more(&session.user_id) || loader.wait(wait).is_none() {
                bail!("app: post {} not found in feed", post_id);
            }
        }
        let state = loader
            .feed_mut()
            .toggle_like(self.services.likes.as_ref(), &session.user_id, post_id)?
            .with_context(|| format!("app: like on {} already in progress", post_id))?;
        writeln!(
            out,
            "{} {} · {}",
            if state.liked { "liked" } else { "unliked" },
            post_id,
            plural(state.likes_count, "like")
        )?;
        Ok(())
    }

    fn print_profile(&self, user_id: Option<String>, out: &mut dyn Write) -> Result<()> {
        let user_id = match user_id {
            Some(id) => id,
            None => self.sessions.require().map(|s| s.user_id)?,
        };
        let profile = profile::fetch_profile(self.services.profiles.as_ref(), &user_id)
            .with_context(|| format!("app: profile {} not found", user_id))?;
        let mut grid = UserPosts::new(&user_id);
        grid.load(self.services.posts.as_ref());

        writeln!(out, "@{}", profile.username)?;
        if let Some(bio) = &profile.bio {
            writeln!(out, "{}", bio)?;
        }
        if let Some(url) = self.services.resolver.avatar_url(profile.avatar_url.as_deref()) {
            writeln!(out, "avatar: {}", url)?;
        }
        writeln!(out, "{} posts", grid.len())?;
        for post in grid.posts() {
            let image = self
                .services
                .resolver
                .post_image_url(Some(&post.image_url))
                .unwrap_or_default();
            writeln!(out, "  {} · {} · {}", post.id, post.park_name, image)?;
        }
        Ok(())
    }
}

/// `@user · park · likes · comments`
pub fn feed_line(post: &Post) -> String {
    format!(
        "@{} · {} · {} · {}",
        post.username,
        post.park_name,
        plural(post.likes_count, "like"),
        plural(post.comments_count, "comment")
    )
}

fn plural(count: u64, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    pub state_db: Option<PathBuf>,
}

/// Loads configuration, starts logging and runs one command against the
/// configured backend, or the offline demo data when none is configured.
pub fn run(args: Vec<String>, options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file,
        env_prefix: None,
    })
    .context("app: load config")?;
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(cfg.log.filter.as_str()))
        .try_init();

    let command = Command::parse(args)?;

    let store = Arc::new(
        storage::Store::open(storage::Options {
            path: options.state_db,
        })
        .context("app: open storage")?,
    );
    let sessions = Arc::new(session::Manager::new(store));
    sessions.load_existing()?;

    let services = if cfg.backend.is_configured() {
        Services::remote(&cfg, sessions.clone())?
    } else {
        log::info!("app: no backend configured, using demo data");
        Services::demo(&cfg)?
    };

    let app = App::new(cfg, sessions, services);
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    app.execute(command, &mut input, &mut out)
}
