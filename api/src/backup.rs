use chrono::NaiveDate;
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::PAGE_SIZE;
use crate::db::Store;
use crate::error::{BackupError, TokenRefreshError};
use crate::ingest::TrackIngestor;
use crate::models::{Backup, NewBackup};
use crate::playlist::PlaylistLocator;
use crate::spotify::{PlaylistItem, SpotifyApi, TrackObject};
use crate::token::TokenRefresher;
use crate::week::WeekKey;

/// Result of a single-user backup run.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupOutcome {
    /// A backup already exists for this week, nothing was written.
    AlreadyBackedUp(Backup),
    Completed { backup: Backup, tracks: usize },
    TokenFailed(&'static str),
    PlaylistNotFound,
    FetchFailed { status: Option<u16> },
}

impl BackupOutcome {
    pub fn backup(&self) -> Option<&Backup> {
        match self {
            BackupOutcome::AlreadyBackedUp(backup) | BackupOutcome::Completed { backup, .. } => {
                Some(backup)
            }
            _ => None,
        }
    }

    /// User-facing message for the outcomes that did not produce a backup.
    pub fn error_message(&self) -> Option<String> {
        match self {
            BackupOutcome::AlreadyBackedUp(_) | BackupOutcome::Completed { .. } => None,
            BackupOutcome::TokenFailed(message) => Some((*message).to_string()),
            BackupOutcome::PlaylistNotFound => {
                Some("Error getting Discover Weekly playlist ID".to_string())
            }
            BackupOutcome::FetchFailed { status: Some(status) } => {
                Some(format!("Error fetching playlist items: {}", status))
            }
            BackupOutcome::FetchFailed { status: None } => {
                Some("Error fetching playlist items".to_string())
            }
        }
    }
}

/// Wire shape of a backup run: the backup row, or `{ "error": ... }`.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BackupResponse {
    Backup(Backup),
    Error { error: String },
}

impl From<BackupOutcome> for BackupResponse {
    fn from(outcome: BackupOutcome) -> Self {
        match outcome {
            BackupOutcome::AlreadyBackedUp(backup) | BackupOutcome::Completed { backup, .. } => {
                BackupResponse::Backup(backup)
            }
            other => BackupResponse::Error {
                error: other.error_message().unwrap_or_default(),
            },
        }
    }
}

/// Time-ordered so ids sort by creation.
pub fn new_backup_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Brings one user's archive up to date for the current week.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    spotify: Arc<dyn SpotifyApi>,
    tokens: TokenRefresher,
    locator: PlaylistLocator,
    ingestor: TrackIngestor,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        spotify: Arc<dyn SpotifyApi>,
        tokens: TokenRefresher,
        locator: PlaylistLocator,
        ingestor: TrackIngestor,
    ) -> Self {
        Self {
            store,
            spotify,
            tokens,
            locator,
            ingestor,
        }
    }

    pub async fn run(&self, user_id: &str) -> Result<BackupOutcome, BackupError> {
        self.run_for_week(user_id, WeekKey::current()).await
    }

    pub async fn run_on(&self, user_id: &str, date: NaiveDate) -> Result<BackupOutcome, BackupError> {
        self.run_for_week(user_id, WeekKey::of(date)).await
    }

    pub async fn run_for_week(
        &self,
        user_id: &str,
        week: WeekKey,
    ) -> Result<BackupOutcome, BackupError> {
        if let Some(existing) = self.store.find_backup(user_id, week).await? {
            tracing::info!("{} already backed up for {}", user_id, week);
            return Ok(BackupOutcome::AlreadyBackedUp(existing));
        }

        let access_token = match self.tokens.for_user(user_id).await {
            Ok(token) => token,
            Err(TokenRefreshError::NoAccount) => {
                return Ok(BackupOutcome::TokenFailed("No account found"));
            }
            Err(e) => {
                tracing::error!("could not refresh token for {}: {}", user_id, e);
                return Ok(BackupOutcome::TokenFailed("Error refreshing access token"));
            }
        };

        let Some(playlist_id) = self.locator.locate(user_id, &access_token).await else {
            return Ok(BackupOutcome::PlaylistNotFound);
        };

        let tracks = match self
            .spotify
            .playlist_tracks(&access_token, &playlist_id, PAGE_SIZE, 0)
            .await
        {
            Ok(page) => page
                .items
                .into_iter()
                .filter_map(PlaylistItem::into_track)
                .collect::<Vec<TrackObject>>(),
            Err(e) => {
                tracing::error!("failed to fetch items of {} for {}: {}", playlist_id, user_id, e);
                return Ok(BackupOutcome::FetchFailed { status: e.status() });
            }
        };

        let new_backup = NewBackup {
            backup_id: new_backup_id(),
            user_id: user_id.to_string(),
            week: week.week_i32(),
            year: week.year,
        };

        let Some(backup) = self.store.insert_backup(&new_backup).await? else {
            // Another run claimed this week between our check and the insert.
            let existing = self.store.find_backup(user_id, week).await?.ok_or_else(|| {
                anyhow::anyhow!("backup for {} {} vanished after conflict", user_id, week)
            })?;
            tracing::info!("{} was backed up concurrently for {}", user_id, week);
            return Ok(BackupOutcome::AlreadyBackedUp(existing));
        };

        try_join_all(tracks.iter().map(|track| {
            let backup_id = backup.backup_id.as_str();
            async move {
                let track_id = self.ingestor.ingest(track).await?;
                self.store
                    .link_backup_track(backup_id, &track_id)
                    .await
                    .map_err(BackupError::Store)
            }
        }))
        .await
        .map_err(|e| {
            tracing::error!(
                "backup {} for {} is incomplete: {}",
                backup.backup_id,
                user_id,
                e
            );
            e
        })?;

        tracing::info!(
            "backed up {} tracks for {} ({})",
            tracks.len(),
            user_id,
            week
        );

        Ok(BackupOutcome::Completed {
            backup,
            tracks: tracks.len(),
        })
    }
}
