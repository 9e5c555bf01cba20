use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli_style;

use cli_style::{
    get_prompt, get_styles, print_empty_list, print_error, print_goodbye, print_info,
    print_key_value, print_key_value_highlight, print_list_item, print_section_footer,
    print_section_header, print_success, print_warning, print_welcome,
};

use lumajoyaron_client::backend::BackendClient;
use lumajoyaron_client::catalog::{
    BrowseRequest, BrowseSort, CatalogError, CatalogService, Content, ContentId, ContentType,
};
use lumajoyaron_client::config::{AppConfig, CliConfig, FileConfig};
use lumajoyaron_client::playback::{
    format_time, PlaybackState, PlayerEvent, PlayerSession, ProgressSync,
};
use lumajoyaron_client::profile::{display_name, ProfileService, ProfileUpdate};
use lumajoyaron_client::search::{SearchController, SearchForm, SearchService, SearchState};
use lumajoyaron_client::session::{
    submit_sign_up, AuthCallback, CallbackOutcome, SessionStore, SignUpFlowState, SignUpForm,
};
use lumajoyaron_client::watchlist::{Membership, WatchlistAction, WatchlistToggle};

use rustyline::{
    completion::Completer, highlight::Highlighter, history::FileHistory, validate::Validator,
    CompletionType, Config, Editor, Helper,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles=get_styles())]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Project URL of the hosted backend.
    #[clap(long)]
    pub backend_url: Option<String>,

    /// Public API key sent with every request.
    #[clap(long)]
    pub anon_key: Option<String>,

    /// Site the confirmation emails redirect back to.
    #[clap(long)]
    pub site_url: Option<String>,

    /// Timeout for each backend request, in seconds.
    #[clap(long)]
    pub request_timeout_sec: Option<u64>,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            backend_url: self.backend_url.clone(),
            anon_key: self.anon_key.clone(),
            site_url: self.site_url.clone(),
            request_timeout_sec: self.request_timeout_sec,
        }
    }
}

#[derive(Parser)]
#[command(styles=get_styles(),name = "")]
struct InnerCli {
    #[command(subcommand)]
    command: InnerCommand,
}

#[derive(Subcommand)]
enum InnerCommand {
    /// Signs in with email and password.
    SignIn { email: String, password: String },

    /// Creates an account. A confirmation email is sent unless the
    /// backend confirms accounts right away.
    SignUp {
        email: String,
        password: String,
        confirm_password: String,
        #[clap(long)]
        full_name: Option<String>,
        /// Accept the terms and conditions.
        #[clap(long)]
        accept_terms: bool,
    },

    /// Signs out. The local session is cleared even if the backend fails.
    SignOut,

    /// Completes an email confirmation from the redirect URL.
    Callback { url: String },

    /// Shows the current session.
    Whoami,

    /// Shows the profile, or updates it when a flag is given.
    Profile {
        #[clap(long)]
        full_name: Option<String>,
        #[clap(long)]
        avatar_url: Option<String>,
    },

    /// Shows the home page rows.
    Home,

    /// Browses the catalog.
    Browse {
        #[clap(long = "type")]
        content_type: Option<ContentType>,
        #[clap(long)]
        genre: Option<String>,
        /// newest, popular or rating.
        #[clap(long, default_value = "popular")]
        sort: BrowseSort,
        #[clap(long, default_value_t = 1)]
        page: usize,
    },

    /// Lists all genres.
    Genres,

    /// Shows one movie or series.
    Show {
        content_type: ContentType,
        slug: String,
    },

    /// Searches the catalog with the current filters.
    Search { query: Vec<String> },

    /// Shows or changes the search filters.
    Filters {
        #[command(subcommand)]
        action: Option<FiltersCommand>,
    },

    /// Plays content from the start, reporting progress as it goes.
    Watch {
        content_id: ContentId,
        /// Length of the video, in seconds.
        #[clap(long, default_value_t = 120.0)]
        duration: f64,
        /// Pause at this position instead of playing to the end.
        #[clap(long)]
        stop_at: Option<f64>,
    },

    /// Manages the watchlist.
    Watchlist {
        #[command(subcommand)]
        action: WatchlistCommand,
    },

    /// Shows the latest blog posts.
    Blog,

    /// Shows the featured movies with their genres and ratings.
    Featured,

    /// Close this program.
    Exit,
}

#[derive(Subcommand)]
enum FiltersCommand {
    /// Sets a filter: type, year, rating or quality. Use "all" to clear one.
    Set { field: String, value: String },
    /// Clears every filter.
    Reset,
}

#[derive(Subcommand)]
enum WatchlistCommand {
    Status { content_id: ContentId },
    Add { content_id: ContentId },
    Remove { content_id: ContentId },
    Toggle { content_id: ContentId },
    List,
}

enum CommandExecutionResult {
    Ok,
    Exit,
    Error(String),
}

// =============================================================================
// Shell state
// =============================================================================

struct App {
    store: Arc<SessionStore>,
    profiles: Arc<ProfileService>,
    catalog: Arc<CatalogService>,
    search: SearchController,
    search_form: SearchForm,
    search_wait: Duration,
    watchlist: WatchlistToggle,
    progress: Arc<ProgressSync>,
    shutdown: CancellationToken,
    refresh: Option<JoinHandle<()>>,
}

impl App {
    async fn connect(config: &AppConfig) -> Result<Self> {
        let client = Arc::new(
            BackendClient::new(
                config.backend_url.clone(),
                config.anon_key.clone(),
                config.request_timeout_sec,
            )
            .context("Failed to create backend client")?,
        );

        let shutdown = CancellationToken::new();
        let refresh = config
            .auth
            .auto_refresh
            .then(|| client.spawn_auto_refresh(shutdown.clone()));

        let profiles = Arc::new(ProfileService::new(client.clone()));
        let store = SessionStore::start(client.clone(), profiles.clone(), &config.site_url);
        store.wait_until(|snapshot| !snapshot.loading).await;

        let catalog = Arc::new(CatalogService::new(
            client.clone(),
            config.catalog.browse_page_size,
        ));
        let search = SearchController::start(
            Arc::new(SearchService::new(client.clone(), config.search.page_size)),
            config.search.debounce,
        );
        let watchlist =
            WatchlistToggle::new(store.clone(), client.clone(), client.clone(), catalog.clone());
        let progress = Arc::new(ProgressSync::new(client.clone()));

        Ok(Self {
            store,
            profiles,
            catalog,
            search,
            search_form: SearchForm::default(),
            search_wait: config.search.debounce
                + Duration::from_secs(config.request_timeout_sec + 1),
            watchlist,
            progress,
            shutdown,
            refresh,
        })
    }

    fn prompt(&self) -> String {
        let name = self
            .store
            .current_user()
            .and_then(|user| user.email.clone());
        get_prompt(name.as_deref())
    }

    async fn shutdown(self) {
        self.shutdown.cancel();
        self.store.shutdown();
        if let Some(refresh) = self.refresh {
            let _ = refresh.await;
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn execute_command(line: String, app: &mut App) -> CommandExecutionResult {
    if line.trim().is_empty() {
        return CommandExecutionResult::Ok;
    }

    let args =
        shlex::split(&line).unwrap_or_else(|| line.split_whitespace().map(String::from).collect());

    let cli = InnerCli::try_parse_from(std::iter::once(" ").chain(args.iter().map(String::as_str)));

    match cli {
        Ok(cli) => {
            if matches!(cli.command, InnerCommand::Exit) {
                return CommandExecutionResult::Exit;
            }
            if let Err(err) = run_command(cli.command, app).await {
                return CommandExecutionResult::Error(format!("{:#}", err));
            }
        }
        Err(e) => {
            if e.print().is_err() {
                println!("{}", e);
            }
        }
    }
    CommandExecutionResult::Ok
}

async fn run_command(command: InnerCommand, app: &mut App) -> Result<()> {
    match command {
        InnerCommand::SignIn { email, password } => {
            let session = app.store.sign_in(&email, &password).await?;
            print_success(&format!(
                "Signed in as {}",
                session.user.email.as_deref().unwrap_or("unknown")
            ));
        }
        InnerCommand::SignUp {
            email,
            password,
            confirm_password,
            full_name,
            accept_terms,
        } => {
            let form = SignUpForm {
                full_name: full_name.unwrap_or_default(),
                email,
                password,
                confirm_password,
                accepted_terms: accept_terms,
            };
            print_key_value("Password strength", form.password_strength().label());
            let SignUpFlowState::CheckEmail {
                email,
                redirect_after,
            } = submit_sign_up(&app.store, &form).await?;
            print_success(&format!(
                "Check your email: we sent a confirmation link to {}",
                email
            ));
            tokio::time::sleep(redirect_after).await;
            if app.store.current_user().is_some() {
                print_info("Your account is already confirmed, you are signed in.");
            } else {
                print_info("Sign in once you have confirmed your address.");
            }
        }
        InnerCommand::SignOut => {
            app.store.sign_out().await;
            print_success("Signed out");
        }
        InnerCommand::Callback { url } => match AuthCallback::parse(&url).complete(&app.store).await {
            CallbackOutcome::Dashboard(session) => print_success(&format!(
                "Email confirmed, signed in as {}",
                session.user.email.as_deref().unwrap_or("unknown")
            )),
            CallbackOutcome::Login {
                error,
                redirect_after,
            } => {
                print_error(&error);
                tokio::time::sleep(redirect_after).await;
                print_info("Back to sign in.");
            }
        },
        InnerCommand::Whoami => {
            let snapshot = app.store.snapshot();
            let Some(user) = snapshot.user else {
                print_empty_list("Not signed in");
                return Ok(());
            };
            let profile = app.profiles.get_profile(user.id).await.unwrap_or_else(|e| {
                warn!("Failed to load profile for {}: {}", user.id, e);
                None
            });
            print_section_header("Session");
            print_key_value_highlight("Name", &display_name(profile.as_ref(), &user));
            print_key_value("Email", user.email.as_deref().unwrap_or("-"));
            print_key_value("User id", &user.id.to_string());
            print_key_value("Confirmed", &user.is_confirmed().to_string());
            if let Some(session) = snapshot.session {
                print_key_value("Expires at", &session.expires_at.to_string());
            }
            print_section_footer();
        }
        InnerCommand::Profile {
            full_name,
            avatar_url,
        } => {
            let user = app
                .store
                .current_user()
                .context("Sign in to see your profile")?;
            let update = ProfileUpdate {
                full_name,
                avatar_url,
            };
            if !update.is_empty() {
                app.profiles.update_profile(user.id, &update).await?;
                print_success("Profile updated");
            }
            match app.profiles.get_profile(user.id).await? {
                Some(profile) => {
                    print_section_header("Profile");
                    print_key_value_highlight("Name", &display_name(Some(&profile), &user));
                    print_key_value(
                        "Subscription",
                        profile.subscription_status.as_deref().unwrap_or("-"),
                    );
                    if let Some(ends_at) = profile.subscription_ends_at {
                        print_key_value("Subscription ends", &ends_at.to_string());
                    }
                    if let Some(avatar) = profile.avatar_url.as_deref() {
                        print_key_value("Avatar", avatar);
                    }
                    print_section_footer();
                }
                None => print_empty_list("No profile yet"),
            }
        }
        InnerCommand::Home => {
            let rows = app.catalog.home_rows().await;
            print_row("Featured", &rows.featured);
            print_row("Trending Now", &rows.trending);
            print_row("Popular Movies", &rows.popular_movies);
            print_row("Popular Series", &rows.popular_series);
            print_row("Recently Added", &rows.recent);
        }
        InnerCommand::Browse {
            content_type,
            genre,
            sort,
            page,
        } => {
            let request = BrowseRequest {
                content_type,
                genre_slug: genre,
                sort,
                page: page.max(1),
            };
            let page = app.catalog.browse(&request).await?;
            let title = match &page.genre {
                Some(genre) => format!("{} ({})", genre.name, sort),
                None => format!("Browse ({})", sort),
            };
            print_section_header(&title);
            print_contents(&page.items);
            print_key_value(
                "Page",
                &format!(
                    "{} of {} ({} titles)",
                    page.page,
                    page.total_pages.max(1),
                    page.total
                ),
            );
            print_section_footer();
        }
        InnerCommand::Genres => {
            let genres = app.catalog.genres().await?;
            print_section_header("Genres");
            if genres.is_empty() {
                print_empty_list("No genres");
            }
            for genre in genres {
                print_list_item(&format!("{} [{}]", genre.name, genre.slug), 0);
            }
            print_section_footer();
        }
        InnerCommand::Show { content_type, slug } => {
            let content = app.catalog.get_content(content_type, &slug).await?;
            print_section_header(&content.title);
            print_key_value_highlight("Id", &content.id.to_string());
            print_key_value("Type", content.content_type.as_str());
            if let Some(year) = content.release_year {
                print_key_value("Year", &year.to_string());
            }
            if let Some(minutes) = content.duration_minutes {
                print_key_value("Duration", &format_time(f64::from(minutes) * 60.0));
            }
            if let Some(rating) = content.rating.as_deref() {
                print_key_value("Rated", rating);
            }
            if let Some(quality) = content.quality.as_deref() {
                print_key_value("Quality", quality);
            }
            if let Some(imdb) = content.imdb_rating {
                print_key_value("IMDb", &format!("{:.1}", imdb));
            }
            if let Some(genres) = content.genres.as_ref().filter(|g| !g.is_empty()) {
                print_key_value("Genres", &genres.join(", "));
            }
            if let Some(description) = content.description.as_deref() {
                print_key_value("About", description);
            }
            if app.store.current_user().is_some() {
                let membership = app.watchlist.load_status(content.id).await?;
                print_key_value("In watchlist", &describe_membership(membership));
            }
            print_section_footer();
        }
        InnerCommand::Search { query } => {
            let query = query.join(" ");
            let state = await_search(app, &query).await?;
            print_search_state(&state);
        }
        InnerCommand::Filters { action } => {
            match action {
                Some(FiltersCommand::Set { field, value }) => {
                    if !app.search_form.set(&field, &value) {
                        bail!(
                            "Unknown filter '{}'. Valid filters are: type, year, rating, quality",
                            field
                        );
                    }
                }
                Some(FiltersCommand::Reset) => app.search_form.reset(),
                None => {}
            }

            let filters = app.search_form.to_filters();
            let rerun = filters != app.search.filters()
                && !app.search.debounced_query().trim().is_empty();
            let mut states = app.search.subscribe();
            states.borrow_and_update();
            app.search.set_filters(filters);

            print_section_header("Search filters");
            print_key_value("Type", &app.search_form.content_type);
            print_key_value("Year", or_any(&app.search_form.release_year));
            print_key_value("Min rating", or_any(&app.search_form.min_rating));
            print_key_value("Quality", &app.search_form.quality);
            print_section_footer();

            if rerun {
                let settled = tokio::time::timeout(app.search_wait, async {
                    states.changed().await.ok()?;
                    states
                        .wait_for(|s| !matches!(s, SearchState::Loading { .. }))
                        .await
                        .ok()
                        .map(|s| s.clone())
                })
                .await;
                match settled {
                    Ok(Some(state)) => print_search_state(&state),
                    _ => print_warning("Search is taking longer than expected"),
                }
            }
        }
        InnerCommand::Watch {
            content_id,
            duration,
            stop_at,
        } => {
            if !(duration.is_finite() && duration > 0.0) {
                bail!("Duration must be a positive number of seconds");
            }
            watch(app, content_id, duration, stop_at.unwrap_or(duration)).await?;
        }
        InnerCommand::Watchlist { action } => match action {
            WatchlistCommand::Status { content_id } => {
                let membership = app.watchlist.load_status(content_id).await?;
                print_key_value("In watchlist", &describe_membership(membership));
            }
            WatchlistCommand::Add { content_id } => {
                app.watchlist.set(content_id, WatchlistAction::Add).await?;
                print_success("Added to watchlist");
            }
            WatchlistCommand::Remove { content_id } => {
                app.watchlist
                    .set(content_id, WatchlistAction::Remove)
                    .await?;
                print_success("Removed from watchlist");
            }
            WatchlistCommand::Toggle { content_id } => {
                let membership = app.watchlist.toggle(content_id).await?;
                if membership.acknowledged {
                    print_success("Added to watchlist");
                } else {
                    print_success("Removed from watchlist");
                }
            }
            WatchlistCommand::List => {
                let contents = app.watchlist.list().await?;
                print_section_header("My Watchlist");
                print_contents(&contents);
                print_section_footer();
            }
        },
        InnerCommand::Blog => {
            print_section_header("From the Blog");
            match app.catalog.recent_blog_posts().await {
                Some(posts) if posts.is_empty() => print_empty_list("No posts yet"),
                Some(posts) => {
                    for post in posts {
                        print_list_item(&post.title, 0);
                        if let Some(excerpt) = post.excerpt.as_deref() {
                            print_list_item(excerpt, 2);
                        }
                    }
                }
                None => print_empty_list("The blog is unavailable right now"),
            }
            print_section_footer();
        }
        InnerCommand::Featured => {
            let movies = app.catalog.featured_movies().await?;
            print_section_header("Featured Movies");
            if movies.is_empty() {
                print_empty_list("Nothing featured");
            }
            for featured in movies {
                let mut line = featured.movie.title.clone();
                if !featured.genres.is_empty() {
                    line.push_str(&format!(" [{}]", featured.genres.join(", ")));
                }
                if featured.rating.count > 0 {
                    line.push_str(&format!(
                        " ★ {:.1} ({})",
                        featured.rating.average, featured.rating.count
                    ));
                }
                print_list_item(&line, 0);
            }
            print_section_footer();
        }
        InnerCommand::Exit => {}
    }
    Ok(())
}

/// Sets the query and waits for the search it triggers to settle.
async fn await_search(app: &App, query: &str) -> Result<SearchState> {
    app.search.set_query(query);
    let mut states = app.search.subscribe();
    let settled = tokio::time::timeout(
        app.search_wait,
        states.wait_for(|state| match state {
            SearchState::Idle => query.trim().is_empty(),
            SearchState::Loading { .. } => false,
            SearchState::Ready { query: q, .. } | SearchState::Failed { query: q, .. } => {
                q == query
            }
        }),
    )
    .await
    .context("Search timed out")?;
    Ok(settled.map(|s| s.clone()).unwrap_or_else(|_| app.search.state()))
}

/// Simulates a player running from 0 to `stop_at`, one time update per second.
async fn watch(app: &App, content_id: ContentId, duration: f64, stop_at: f64) -> Result<()> {
    let player = PlayerSession::open(&app.store, app.progress.clone(), content_id)?;
    let stop_at = stop_at.clamp(0.0, duration);

    player.send(PlayerEvent::Play)?;
    let mut position = 0.0;
    while position < stop_at {
        position = (position + 1.0).min(stop_at);
        player.send(PlayerEvent::TimeUpdate {
            current_time: position,
            duration,
        })?;
    }
    let last = if stop_at >= duration {
        PlaybackState::Ended
    } else {
        PlaybackState::Paused
    };
    match last {
        PlaybackState::Ended => player.send(PlayerEvent::Ended { duration })?,
        _ => player.send(PlayerEvent::Pause)?,
    }

    let mut status = player.subscribe();
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state == last),
    )
    .await
    .context("Player did not settle")?
    .map(|s| *s)
    .unwrap_or_else(|_| player.status());
    player.close();

    // Let the last progress call land before reporting.
    let deadline = tokio::time::Instant::now() + app.search_wait;
    while app.progress.is_in_flight(content_id) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("Watched content {} up to {}s", content_id, status.position);
    print_key_value_highlight(
        "Position",
        &format!(
            "{} / {}",
            format_time(status.position),
            format_time(status.duration.unwrap_or(duration))
        ),
    );
    print_key_value("State", &format!("{:?}", status.state));
    Ok(())
}

// =============================================================================
// Output helpers
// =============================================================================

fn content_line(content: &Content) -> String {
    let mut line = format!("#{} {}", content.id, content.title);
    if let Some(year) = content.release_year {
        line.push_str(&format!(" ({})", year));
    }
    line.push_str(&format!(" · {}", content.content_type));
    if let Some(quality) = content.quality.as_deref() {
        line.push_str(&format!(" · {}", quality));
    }
    if let Some(imdb) = content.imdb_rating {
        line.push_str(&format!(" · ★ {:.1}", imdb));
    }
    line
}

fn print_contents(contents: &[Content]) {
    if contents.is_empty() {
        print_empty_list("Nothing here yet");
    }
    for content in contents {
        print_list_item(&content_line(content), 0);
    }
}

fn print_row(title: &str, row: &Result<Vec<Content>, CatalogError>) {
    print_section_header(title);
    match row {
        Ok(contents) => print_contents(contents),
        Err(_) => print_empty_list("Failed to load"),
    }
    print_section_footer();
}

fn print_search_state(state: &SearchState) {
    match state {
        SearchState::Idle => print_empty_list("Type something to search"),
        SearchState::Loading { query } => print_info(&format!("Searching for '{}'...", query)),
        SearchState::Ready {
            query,
            results,
            total,
        } => {
            print_section_header(&format!("Results for '{}'", query));
            print_contents(results);
            print_key_value("Total", &total.to_string());
            print_section_footer();
        }
        SearchState::Failed { query, message } => {
            print_error(&format!("Search for '{}' failed: {}", query, message))
        }
    }
}

fn describe_membership(membership: Membership) -> String {
    let shown = if membership.provisional { "yes" } else { "no" };
    if membership.is_pending() {
        format!("{} (saving...)", shown)
    } else {
        shown.to_string()
    }
}

fn or_any(value: &str) -> &str {
    if value.trim().is_empty() {
        "all"
    } else {
        value
    }
}

// =============================================================================
// Line editor
// =============================================================================

#[derive(rustyline_derive::Hinter)]
struct ShellHelper {
    commands_names: Vec<String>,
}

impl ShellHelper {
    pub fn new() -> Self {
        let commands_names: Vec<String> = InnerCli::command()
            .get_subcommands()
            .map(|sc| sc.get_name().to_string())
            .collect();

        ShellHelper { commands_names }
    }
}

impl Completer for ShellHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        if line.contains(' ') {
            return Ok((0, Vec::with_capacity(0)));
        }
        let matches = self
            .commands_names
            .iter()
            .filter(|c| c.starts_with(line))
            .map(|c| c.to_string())
            .collect::<Vec<_>>();

        Ok((0, matches))
    }
}

impl Highlighter for ShellHelper {}
impl Validator for ShellHelper {}
impl Helper for ShellHelper {}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let mut app = runtime.block_on(App::connect(&config))?;
    info!("Connected to {}", config.backend_url);

    print_welcome(&config.backend_url);

    let editor_config = Config::builder()
        .completion_type(CompletionType::List)
        .build();

    let mut rl = Editor::<ShellHelper, FileHistory>::with_config(editor_config)?;
    rl.set_helper(Some(ShellHelper::new()));

    loop {
        let readline = rl.readline(&app.prompt());

        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                if line.trim() == "help" {
                    InnerCli::command().print_long_help()?;
                    continue;
                }
                match runtime.block_on(execute_command(line, &mut app)) {
                    CommandExecutionResult::Ok => {}
                    CommandExecutionResult::Exit => {
                        break;
                    }
                    CommandExecutionResult::Error(err) => {
                        print_error(&err);
                        continue;
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("CTRL-D: exiting.");
                break;
            }
            Err(e) => {
                println!("Error: {:?}", e);
                break;
            }
        }
    }

    runtime.block_on(app.shutdown());
    print_goodbye();
    Ok(())
}
