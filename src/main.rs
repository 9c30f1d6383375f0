use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use market_chat::config::{ChatConfig, LogSettings};
use market_chat::directory::{ListingRecord, ProfileRecord};
use market_chat::model::{ConversationId, ConversationView, ListingId, Message, OrderKey, UserId};
use market_chat::{server, storage, ChatService};

#[derive(Parser)]
#[command(name = "market-chat")]
#[command(about = "Buyer/seller messaging for a student marketplace", version)]
#[command(after_help = "Every conversation belongs to one listing and exactly two users.
Contacting a seller twice about the same listing reopens the same conversation.")]
struct Cli {
    /// Directory holding the .market-chat data directory
    #[arg(short, long, global = true, default_value = ".")]
    path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, database and default config
    Init,

    /// Start the HTTP/WebSocket server
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Add or update a listing in the local mirror
    Listing {
        id: String,

        #[arg(long)]
        owner: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        category: Option<String>,

        /// Image URL; repeat for several, the first is the thumbnail
        #[arg(long = "image")]
        images: Vec<String>,
    },

    /// Add or update a user profile in the local mirror
    Profile {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        avatar: Option<String>,
    },

    /// Contact the seller of a listing (or, as the owner, a buyer)
    Contact {
        listing: String,

        #[arg(short, long)]
        user: String,

        /// Buyer to resume with when acting as the listing owner
        #[arg(long = "with")]
        counterpart: Option<String>,
    },

    /// Send a message
    Send {
        conversation: ConversationId,

        #[arg(short, long)]
        user: String,

        body: String,
    },

    /// Print a conversation's messages
    History {
        conversation: ConversationId,

        #[arg(short, long)]
        user: String,

        /// Only messages after this cursor
        #[arg(long)]
        after: Option<OrderKey>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Mark a conversation read up to a cursor
    Read {
        conversation: ConversationId,

        #[arg(short, long)]
        user: String,

        up_to: OrderKey,
    },

    /// List a user's conversations, most recent first
    Inbox {
        #[arg(short, long)]
        user: String,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ChatConfig::load(&cli.path)?;
    let _log_guard = init_logging(&config.log)?;

    match cli.command {
        Commands::Init => {
            println!("{}", "🚀 Initializing market chat...".cyan().bold());
            let config = storage::init(&cli.path).await?;
            println!(
                "{} Database ready at {}",
                "✓".green(),
                config.database_path.display()
            );
            println!("\n{}", "Next steps:".yellow());
            println!(
                "  1. {} - Mirror a listing",
                "market-chat listing <id> --owner <user> --title <title>".bright_white()
            );
            println!("  2. {} - Start the server", "market-chat serve".bright_white());
        }

        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            println!(
                "{}",
                format!("🌐 Starting server on {}...", config.bind_address())
                    .cyan()
                    .bold()
            );
            server::serve(config).await?;
        }

        Commands::Listing {
            id,
            owner,
            title,
            category,
            images,
        } => {
            let db = storage::open_database(&config.database_path).await?;
            let record = ListingRecord {
                id: ListingId::parse(&id)?,
                owner_id: UserId::parse(&owner)?,
                title,
                category,
                images,
            };
            db.upsert_listing(&record)?;
            println!(
                "{} Listing {} owned by {}",
                "✓".green(),
                record.id.to_string().bright_yellow(),
                record.owner_id.to_string().bright_white()
            );
        }

        Commands::Profile { id, name, avatar } => {
            let db = storage::open_database(&config.database_path).await?;
            let record = ProfileRecord {
                id: UserId::parse(&id)?,
                full_name: name,
                avatar_url: avatar,
            };
            db.upsert_profile(&record)?;
            println!("{} Profile {} saved", "✓".green(), record.id.to_string().bright_yellow());
        }

        Commands::Contact {
            listing,
            user,
            counterpart,
        } => {
            let service = open_service(&config).await?;
            let user = UserId::parse(&user)?;
            let counterpart = counterpart.as_deref().map(UserId::parse).transpose()?;
            let resolution = service
                .start_conversation(&user, &ListingId::parse(&listing)?, counterpart.as_ref())
                .await?;
            let state = if resolution.created {
                "Started".green()
            } else {
                "Resumed".yellow()
            };
            println!(
                "{} conversation {}",
                state,
                resolution.conversation.id.to_string().bright_yellow()
            );
        }

        Commands::Send {
            conversation,
            user,
            body,
        } => {
            let service = open_service(&config).await?;
            let message = service
                .send_message(conversation, &UserId::parse(&user)?, &body, None)
                .await?;
            println!(
                "{} Sent {} {}",
                "✓".green(),
                message.id.to_string().bright_yellow(),
                format!("(cursor {})", message.cursor()).bright_black()
            );
        }

        Commands::History {
            conversation,
            user,
            after,
            limit,
        } => {
            let service = open_service(&config).await?;
            let user = UserId::parse(&user)?;
            let page = service
                .list_messages(conversation, &user, after, limit)
                .await?;

            println!("{}", format!("Conversation {conversation}").cyan().bold());
            println!("{}", "═".repeat(80).bright_black());
            for message in &page.messages {
                print_message(message, &user);
            }
            if let Some(cursor) = page.next_cursor {
                println!("{}", format!("next: --after {cursor}").bright_black());
            }
        }

        Commands::Read {
            conversation,
            user,
            up_to,
        } => {
            let service = open_service(&config).await?;
            let marker = service
                .mark_read(conversation, &UserId::parse(&user)?, up_to)
                .await?;
            println!("{} Read up to {}", "✓".green(), marker.last_read);
        }

        Commands::Inbox { user } => {
            let service = open_service(&config).await?;
            let user = UserId::parse(&user)?;
            let views = service.list_conversations(&user).await?;

            println!("{}", format!("Inbox for {user}").cyan().bold());
            println!("{}", "═".repeat(80).bright_black());
            if views.is_empty() {
                println!("{}", "No conversations yet".bright_black());
            }
            for view in &views {
                print_view(view);
            }
        }
    }

    Ok(())
}

async fn open_service(config: &ChatConfig) -> Result<ChatService> {
    let db = storage::open_database(&config.database_path)
        .await
        .with_context(|| format!("run `market-chat init` first? ({})", config.database_path.display()))?;
    Ok(ChatService::new(db, config))
}

fn print_message(message: &Message, viewer: &UserId) {
    let time = message.created_at.format("%Y-%m-%d %H:%M:%S%.3f");
    let sender = if message.sender_id == *viewer {
        "you".bright_green()
    } else {
        message.sender_id.to_string().bright_blue()
    };
    println!(
        "{} {}: {} {}",
        format!("[{time}]").bright_black(),
        sender.bold(),
        message.body,
        format!("({})", message.order_key).bright_black()
    );
}

fn print_view(view: &ConversationView) {
    let unread = if view.unread_count > 0 {
        format!(" [{} unread]", view.unread_count).bright_red()
    } else {
        "".normal()
    };
    println!(
        "{} {} {}{}",
        view.counterpart().display_name.bright_white().bold(),
        format!("about {}", view.listing.title).yellow(),
        format!("({})", view.conversation.id).bright_black(),
        unread
    );
    if let Some(last) = &view.last_message {
        println!("    {}", last.body.bright_black());
    }
}

/// Stderr output always; a daily rolling file too when `log.directory` is set.
/// `RUST_LOG` wins over the configured filter.
fn init_logging(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .context("invalid log filter")?;

    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "market-chat.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}
