use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use gmail_sync::config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "gmail-sync",
    version,
    about = "Gmail OAuth token lifecycle and inbound email sync"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    config: AppConfig,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the background scheduler
    Serve(ServeArgs),
    /// Sync recent inbox mail for one user, or for every connected user
    Sync(SyncArgs),
    /// Refresh every token that is about to expire
    Refresh,
    /// Check whether a user's token is usable, refreshing it if needed
    TokenStatus {
        #[arg(long)]
        user: String,
    },
    /// List accounts whose tokens were invalidated
    Reauth,
    /// Manage organization OAuth apps and memberships
    Orgs {
        #[command(subcommand)]
        command: OrgCommands,
    },
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Address the HTTP server listens on
    #[arg(long, env = "GMAIL_SYNC_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Serve HTTP only; do not start the refresh/sync jobs
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// User to sync; omit to sync every user with an active token
    #[arg(long)]
    user: Option<String>,

    /// Look-back window in hours
    #[arg(long)]
    hours: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum OrgCommands {
    /// Store an organization's own OAuth client
    SetCredentials {
        org_id: String,
        #[arg(long)]
        org_client_id: String,
        #[arg(long, env = "ORG_GMAIL_CLIENT_SECRET", hide_env_values = true)]
        org_client_secret: String,
        #[arg(long)]
        org_redirect_uri: String,
        /// Store the integration as inactive
        #[arg(long, default_value_t = false)]
        inactive: bool,
    },
    /// Put a user into an organization
    AddMember {
        user_id: String,
        org_id: String,
        #[arg(long, default_value = "member")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use tracing::info;

    use gmail_sync::config::{AppConfig, Pacing};
    use gmail_sync::credentials::CredentialResolver;
    use gmail_sync::db::models::{IntegrationStatus, OrgCredentials};
    use gmail_sync::db::Database;
    use gmail_sync::gmail::GoogleClient;
    use gmail_sync::inbound::InboundSyncEngine;
    use gmail_sync::output::{self, OutputFormat, TokenStatusReport};
    use gmail_sync::scheduler::{BackgroundJobs, MailJobs, Scheduler};
    use gmail_sync::server::{self, AppState};
    use gmail_sync::tokens::TokenRefresher;

    use super::{Cli, Commands, OrgCommands, ServeArgs, SyncArgs};

    /// Everything a command needs, wired from one config.
    struct Services {
        db: Arc<Database>,
        google: Arc<GoogleClient>,
        tokens: Arc<TokenRefresher>,
        engine: Arc<InboundSyncEngine>,
    }

    impl Services {
        fn build(config: &AppConfig) -> Result<Self> {
            let db_path = config
                .database_path()
                .context("resolve gmail-sync database path")?;
            let db = Arc::new(
                config
                    .open_database()
                    .with_context(|| format!("open database at {}", db_path.display()))?,
            );
            let google =
                Arc::new(GoogleClient::from_config(config).context("build google client")?);
            let pacing = Pacing::default();

            let resolver = Arc::new(CredentialResolver::new(
                Arc::clone(&db),
                config.platform_credentials(),
            ));
            let tokens = Arc::new(TokenRefresher::new(
                Arc::clone(&db),
                resolver,
                google.clone(),
                pacing,
            ));
            let engine = Arc::new(InboundSyncEngine::new(
                Arc::clone(&db),
                Arc::clone(&tokens),
                google.clone(),
                pacing,
            ));

            Ok(Self {
                db,
                google,
                tokens,
                engine,
            })
        }

        fn jobs(&self, hours_back: u32) -> MailJobs {
            MailJobs::new(
                Arc::clone(&self.db),
                Arc::clone(&self.tokens),
                Arc::clone(&self.engine),
                Pacing::default(),
                hours_back,
            )
        }
    }

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        match cli.command {
            Commands::Serve(args) => handle_serve(&cli.config, args).await,
            Commands::Sync(args) => handle_sync(&cli.config, args, format).await,
            Commands::Refresh => handle_refresh(&cli.config, format).await,
            Commands::TokenStatus { user } => handle_token_status(&cli.config, &user, format).await,
            Commands::Reauth => handle_reauth(&cli.config, format),
            Commands::Orgs { command } => handle_orgs(&cli.config, command),
        }
    }

    async fn handle_serve(config: &AppConfig, args: ServeArgs) -> Result<()> {
        let services = Services::build(config)?;
        let scheduler = Scheduler::new(Arc::new(services.jobs(config.scheduled_hours_back)));

        let state = Arc::new(AppState {
            db: Arc::clone(&services.db),
            tokens: Arc::clone(&services.tokens),
            engine: Arc::clone(&services.engine),
            mail: services.google.clone(),
            default_hours_back: config.default_hours_back,
        });

        let listener = tokio::net::TcpListener::bind(&args.bind)
            .await
            .with_context(|| format!("bind http listener on {}", args.bind))?;
        info!(addr = %args.bind, "http server listening");

        if !args.no_scheduler {
            scheduler.start();
        }

        axum::serve(listener, server::router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("http server")?;

        scheduler.stop().await;
        info!("shutdown complete");
        Ok(())
    }

    async fn shutdown_signal() {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("listen for ctrl-c: {error}");
            std::future::pending::<()>().await;
        }
        info!("ctrl-c received, shutting down");
    }

    async fn handle_sync(config: &AppConfig, args: SyncArgs, format: OutputFormat) -> Result<()> {
        let services = Services::build(config)?;
        let hours = args.hours.unwrap_or(config.default_hours_back);

        match args.user {
            Some(user_id) => {
                let result = services.engine.sync_recent_emails(&user_id, hours).await;
                println!("{}", output::format_sync_result(format, &user_id, &result)?);
            }
            None => {
                let summary = services.jobs(hours).sync_all_users().await?;
                println!("{}", output::format_sync_all(format, &summary)?);
            }
        }
        Ok(())
    }

    async fn handle_refresh(config: &AppConfig, format: OutputFormat) -> Result<()> {
        let services = Services::build(config)?;
        let summary = services.tokens.refresh_all_tokens().await?;
        println!("{}", output::format_refresh_summary(format, &summary)?);
        Ok(())
    }

    async fn handle_token_status(config: &AppConfig, user_id: &str, format: OutputFormat) -> Result<()> {
        let services = Services::build(config)?;
        let valid = services.tokens.validate_token_for_user(user_id).await;
        let report = TokenStatusReport {
            user_id: user_id.to_string(),
            valid,
            counts: services
                .db
                .token_status_counts()
                .context("count tokens by status")?,
        };
        println!("{}", output::format_token_status(format, &report)?);
        Ok(())
    }

    fn handle_reauth(config: &AppConfig, format: OutputFormat) -> Result<()> {
        let services = Services::build(config)?;
        let accounts = services
            .tokens
            .accounts_needing_reauth()
            .context("list accounts needing re-authorization")?;
        println!("{}", output::format_reauth_accounts(format, &accounts)?);
        Ok(())
    }

    fn handle_orgs(config: &AppConfig, command: OrgCommands) -> Result<()> {
        let db = config.open_database().context("open gmail-sync database")?;
        match command {
            OrgCommands::SetCredentials {
                org_id,
                org_client_id,
                org_client_secret,
                org_redirect_uri,
                inactive,
            } => {
                let status = if inactive {
                    IntegrationStatus::Inactive
                } else {
                    IntegrationStatus::Active
                };
                db.upsert_org_credentials(&OrgCredentials {
                    org_id: org_id.clone(),
                    client_id: org_client_id,
                    client_secret: org_client_secret,
                    redirect_uri: org_redirect_uri,
                    status,
                })
                .with_context(|| format!("store oauth client for {org_id}"))?;
                println!("Stored {status} Gmail integration for organization {org_id}.");
            }
            OrgCommands::AddMember {
                user_id,
                org_id,
                role,
            } => {
                db.set_membership(&user_id, &org_id, &role)
                    .with_context(|| format!("add {user_id} to {org_id}"))?;
                println!("Added {user_id} to {org_id} as {role}.");
            }
        }
        Ok(())
    }
}
