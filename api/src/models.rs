use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub user_id: String,
    pub provider: String,
    pub provider_account_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistLink {
    pub user_id: String,
    pub discover_weekly_id: String,
}

/// One archived snapshot. `backup_id` is the only handle exposed outside
/// the service.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub id: i64,
    pub backup_id: String,
    pub user_id: String,
    pub week: i32,
    pub year: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBackup {
    pub backup_id: String,
    pub user_id: String,
    pub week: i32,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub cover_art_url: String,
    pub colors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub image_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub weekly_backup: bool,
    pub automatic_sync_to_playlist: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            weekly_backup: true,
            automatic_sync_to_playlist: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Setting {
    WeeklyBackup,
    AutomaticSyncToPlaylist,
}

impl Setting {
    pub fn column(self) -> &'static str {
        match self {
            Setting::WeeklyBackup => "weekly_backup",
            Setting::AutomaticSyncToPlaylist => "automatic_sync_to_playlist",
        }
    }

    pub fn get(self, settings: &UserSettings) -> bool {
        match self {
            Setting::WeeklyBackup => settings.weekly_backup,
            Setting::AutomaticSyncToPlaylist => settings.automatic_sync_to_playlist,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackWithArtists {
    #[serde(flatten)]
    pub track: Track,
    pub artists: Vec<Artist>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDetail {
    #[serde(flatten)]
    pub backup: Backup,
    pub tracks: Vec<TrackWithArtists>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtistFrequency {
    pub id: String,
    pub name: String,
    pub image_url: String,
    pub track_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTotals {
    pub total_backups: i64,
    pub total_tracks: i64,
    pub total_artists: i64,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentBackup {
    pub backup_id: String,
    pub year: i32,
    pub week: i32,
}
