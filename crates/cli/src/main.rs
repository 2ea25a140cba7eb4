//! Naked Pineapple cart CLI - drive the cart engine from a terminal.
//!
//! # Usage
//!
//! ```bash
//! # Add two tees to the guest cart of session "tab-1"
//! np-cart --session tab-1 add --variant v-1 --product p-1 --name "Pineapple Tee" --price 24.50 -q 2
//!
//! # Log in: merges the guest cart into customer-42's server cart
//! np-cart --session tab-1 login --user customer-42
//!
//! # Work on the server cart
//! np-cart --session tab-1 --user customer-42 update v-1 5
//! np-cart --session tab-1 --user customer-42 checkout --accept
//! ```
//!
//! # Environment Variables
//!
//! - `CART_API_URL` - Remote cart service base URL (required)
//! - `CATALOG_API_URL` - Catalog service base URL (defaults to `CART_API_URL`)
//! - `CART_API_TOKEN` - Bearer token for both services
//! - `CART_REQUEST_TIMEOUT_MS` - Per-request timeout (default 10000)
//! - `CART_LOCAL_STORE_DIR` - Guest snapshot directory (default `.cart`)
//! - `SENTRY_DSN`, `SENTRY_ENVIRONMENT` - Error tracking

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use naked_pineapple_cart::CartConfig;
use rust_decimal::Decimal;
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{CliError, Session};

#[derive(Parser)]
#[command(name = "np-cart")]
#[command(author, version, about = "Naked Pineapple cart engine CLI")]
struct Cli {
    /// Session id scoping the guest cart snapshot
    #[arg(short, long, global = true, default_value = "default")]
    session: String,

    /// Act as this signed-in customer (omit for a guest)
    #[arg(short, long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cart
    Show,
    /// Add a product variant
    Add {
        #[arg(long)]
        variant: String,

        #[arg(long)]
        product: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// Unit price snapshot, e.g. 24.50
        #[arg(long)]
        price: Decimal,

        /// Currency code (USD, EUR, GBP, CAD, AUD)
        #[arg(long, default_value = "USD")]
        currency: String,

        #[arg(short, long, default_value_t = 1)]
        quantity: u32,
    },
    /// Remove a variant's line
    Remove { variant: String },
    /// Set a variant's quantity (0 or less removes the line)
    Update {
        variant: String,
        #[arg(allow_negative_numbers = true)]
        quantity: i64,
    },
    /// Remove every line
    Clear,
    /// Log in, merging the guest cart into the customer's cart
    Login {
        #[arg(long)]
        user: String,
    },
    /// Log out, clearing every cart store
    Logout,
    /// Verify the cart against the catalog and finish checkout
    Checkout {
        /// Accept catalog corrections without asking again
        #[arg(long)]
        accept: bool,
    },
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &CartConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match CartConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt::init();
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    // Sentry must be initialized before the tracing subscriber
    let _sentry_guard = init_sentry(&config);

    // Defaults to info level for the engine if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "naked_pineapple_cart=info,naked_pineapple_cli=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    if let Err(e) = run(cli, &config).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: &CartConfig) -> Result<(), CliError> {
    let session = Session::open(config, &cli.session, cli.user.as_deref()).await?;

    match cli.command {
        Commands::Show => session.show(),
        Commands::Add {
            variant,
            product,
            name,
            price,
            currency,
            quantity,
        } => {
            session
                .add(&variant, &product, &name, price, &currency, quantity)
                .await?;
        }
        Commands::Remove { variant } => session.remove(&variant).await?,
        Commands::Update { variant, quantity } => session.update(&variant, quantity).await?,
        Commands::Clear => session.clear().await?,
        Commands::Login { user } => session.login(&user).await?,
        Commands::Logout => session.logout().await?,
        Commands::Checkout { accept } => session.checkout(accept).await?,
    }
    Ok(())
}
