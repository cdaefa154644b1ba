use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::Client;
use std::sync::Arc;
use weekly_archive_api::{
    backup::BackupOutcome,
    config::Config,
    db::Store,
    fanout::{self, BackupDispatcher, LocalDispatcher},
    models::Setting,
    Services,
};

#[derive(Parser)]
#[command(name = "archivectl")]
#[command(about = "weekly archive operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up one user's playlist for the current week
    Backup {
        #[arg(value_name = "USER_ID")]
        user_id: String,

        /// Back up as if today were this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Dispatch a backup for every user with weekly backups enabled
    BackupAll {
        /// Run the backups in this process even when BACKUP_ENDPOINT is set
        #[arg(long)]
        local: bool,
    },

    /// Fill in missing images for a user's most frequent artists
    EnrichArtists {
        #[arg(value_name = "USER_ID")]
        user_id: String,

        /// Number of artists to look at
        #[arg(short, long, default_value_t = 5)]
        limit: i64,
    },

    /// Show a user's settings, optionally flipping one first
    Settings {
        #[arg(value_name = "USER_ID")]
        user_id: String,

        #[arg(long, value_enum)]
        toggle: Option<SettingArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SettingArg {
    WeeklyBackup,
    AutomaticSyncToPlaylist,
}

impl From<SettingArg> for Setting {
    fn from(arg: SettingArg) -> Self {
        match arg {
            SettingArg::WeeklyBackup => Setting::WeeklyBackup,
            SettingArg::AutomaticSyncToPlaylist => Setting::AutomaticSyncToPlaylist,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("archivectl=info,weekly_archive_api=info")
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let http = Client::new();
    let services = Services::connect(&config, http.clone())
        .await
        .context("Failed to initialize services")?;

    match cli.command {
        Commands::Backup { user_id, date } => handle_backup(&services, &user_id, date).await,
        Commands::BackupAll { local } => handle_backup_all(&config, &services, http, local).await,
        Commands::EnrichArtists { user_id, limit } => {
            handle_enrich_artists(&services, &user_id, limit).await
        }
        Commands::Settings { user_id, toggle } => {
            handle_settings(&services, &user_id, toggle.map(Setting::from)).await
        }
    }
}

async fn handle_backup(services: &Services, user_id: &str, date: Option<NaiveDate>) -> Result<()> {
    let outcome = match date {
        Some(date) => services.reconciler.run_on(user_id, date).await,
        None => services.reconciler.run(user_id).await,
    }
    .with_context(|| format!("Backup for {} failed", user_id))?;

    match outcome {
        BackupOutcome::Completed { backup, tracks } => {
            tracing::info!(
                "Created backup {} ({}-W{:02}) with {} tracks",
                backup.backup_id,
                backup.year,
                backup.week,
                tracks
            );
        }
        BackupOutcome::AlreadyBackedUp(backup) => {
            tracing::info!(
                "Already backed up as {} ({}-W{:02})",
                backup.backup_id,
                backup.year,
                backup.week
            );
        }
        other => {
            bail!(
                "Backup for {} did not run: {}",
                user_id,
                other.error_message().unwrap_or_default()
            );
        }
    }

    Ok(())
}

async fn handle_backup_all(
    config: &Config,
    services: &Services,
    http: Client,
    local: bool,
) -> Result<()> {
    let dispatcher: Arc<dyn BackupDispatcher> = if local {
        Arc::new(LocalDispatcher::new(services.reconciler.clone()))
    } else {
        fanout::dispatcher_for(
            config.backup_endpoint.as_deref(),
            config.service_token.clone(),
            http,
            services.reconciler.clone(),
        )
    };

    let summary = fanout::run_weekly(services.store.as_ref(), dispatcher.as_ref()).await?;
    tracing::info!(
        "Dispatched {} of {} users, waiting for them to finish",
        summary.dispatched,
        summary.users
    );

    dispatcher.wait_idle().await;

    tracing::info!(
        "Weekly backup complete. Users: {}, Dispatched: {}, Failed to dispatch: {}",
        summary.users,
        summary.dispatched,
        summary.failed
    );
    Ok(())
}

async fn handle_enrich_artists(services: &Services, user_id: &str, limit: i64) -> Result<()> {
    let token = services
        .tokens
        .for_user(user_id)
        .await
        .with_context(|| format!("No usable Spotify credentials for {}", user_id))?;

    let artists = services.store.frequent_artists(user_id, limit).await?;
    let missing = artists.iter().filter(|a| a.image_url.is_empty()).count();
    let enriched = services.artists.enrich(&token, artists).await;
    let still_missing = enriched.iter().filter(|a| a.image_url.is_empty()).count();

    for artist in &enriched {
        tracing::info!(
            "{} ({} tracks): {}",
            artist.name,
            artist.track_count,
            if artist.image_url.is_empty() {
                "no image"
            } else {
                artist.image_url.as_str()
            }
        );
    }
    tracing::info!(
        "Filled {} of {} missing artist images",
        missing - still_missing,
        missing
    );
    Ok(())
}

async fn handle_settings(services: &Services, user_id: &str, toggle: Option<Setting>) -> Result<()> {
    let settings = match toggle {
        Some(setting) => services.store.toggle_setting(user_id, setting).await?,
        None => services.store.ensure_settings(user_id).await?,
    };

    tracing::info!(
        "{}: weekly backup {}, automatic sync to playlist {}",
        user_id,
        settings.weekly_backup,
        settings.automatic_sync_to_playlist
    );
    Ok(())
}
