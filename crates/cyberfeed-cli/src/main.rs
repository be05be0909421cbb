use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cyberfeed_aggregate::{Aggregator, FeedConfig, FeedPager};
use cyberfeed_core::{CanonicalArticle, Session};
use cyberfeed_storage::{handle_post_auth, BookmarkStore, PgBookmarkStore, StoreError};
use tracing::info;
use tracing_subscriber::{fmt as tfmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cyberfeed")]
#[command(about = "Cybercrime news feed command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one page of the aggregated feed.
    Feed {
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Print the articles as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Check that the bookmark database is reachable.
    Check {
        #[arg(long)]
        user: Option<Uuid>,
    },
    /// Record a sign-in: create the profile or bump its last login.
    Login {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        email: Option<String>,
    },
    Bookmarks {
        #[command(subcommand)]
        action: BookmarkAction,
    },
    Migrate,
    Serve,
}

#[derive(Debug, Subcommand)]
enum BookmarkAction {
    List {
        #[arg(long)]
        user: Uuid,
    },
    /// Bookmark the `index`-th article of a freshly fetched feed page.
    Add {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        index: usize,
    },
    Remove {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        article_id: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = FeedConfig::from_env();

    match cli.command.unwrap_or(Commands::Feed { page: 1, json: false }) {
        Commands::Feed { page, json } => {
            let pager = load_page(&config, page).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(pager.articles())?);
            } else if pager.articles().is_empty() {
                println!("end of feed");
            } else {
                print_articles(pager.articles());
            }
        }
        Commands::Check { user } => {
            let store = PgBookmarkStore::connect_lazy(&config.database_url)?;
            let session = user.map(Session::for_user);
            match store.check_connection(session.as_ref()).await {
                Ok(true) => println!("bookmark database: connected"),
                Ok(false) => println!("bookmark database: unreachable"),
                Err(StoreError::SchemaMissing) => bail!(StoreError::SchemaMissing),
                Err(err) => return Err(err).context("checking bookmark database"),
            }
        }
        Commands::Login { user, email } => {
            let store = PgBookmarkStore::connect(&config.database_url).await?;
            let session = Session {
                email,
                ..Session::for_user(user)
            };
            let profile = handle_post_auth(&store, &session).await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Commands::Bookmarks { action } => {
            let store = PgBookmarkStore::connect(&config.database_url).await?;
            run_bookmark_action(&config, &store, action).await?;
        }
        Commands::Migrate => {
            let store = PgBookmarkStore::connect(&config.database_url).await?;
            store.run_migrations().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            cyberfeed_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn load_page(config: &FeedConfig, page: u32) -> Result<FeedPager> {
    if page == 0 {
        bail!("page must be at least 1");
    }
    let aggregator = Aggregator::from_config(config).await?;
    info!(providers = ?aggregator.provider_labels(), page, "fetching feed");
    let mut pager = FeedPager::new();
    pager.load_page(&aggregator, page).await;
    if let Some(message) = pager.error() {
        bail!("{message}");
    }
    Ok(pager)
}

async fn run_bookmark_action(
    config: &FeedConfig,
    store: &PgBookmarkStore,
    action: BookmarkAction,
) -> Result<()> {
    match action {
        BookmarkAction::List { user } => {
            let articles = store.get_bookmarks(user).await?;
            if articles.is_empty() {
                println!("no bookmarks");
            }
            print_articles(&articles);
        }
        BookmarkAction::Add { user, page, index } => {
            let mut pager = load_page(config, page).await?;
            let Some(article) = pager.articles().get(index).cloned() else {
                bail!(
                    "page {page} has {} articles; index {index} is out of range",
                    pager.articles().len()
                );
            };
            let session = Session::for_user(user);
            let notice = pager
                .toggle_bookmark(&article.id, Some(&session), store)
                .await?;
            println!("{}: {}", notice.message(), article.title);
        }
        BookmarkAction::Remove { user, article_id } => {
            let removed = store.remove_bookmark(&article_id, user).await?;
            println!("Bookmark removed successfully: {} row(s)", removed.len());
        }
    }
    Ok(())
}

fn print_articles(articles: &[CanonicalArticle]) {
    for article in articles {
        println!("[{}] {}", article.source, article.title);
        println!("    {} | {}", article.timestamp, article.url);
        println!("    id={}", article.id);
    }
}
