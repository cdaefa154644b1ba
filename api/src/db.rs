use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;

use crate::config::PROVIDER;
use crate::models::*;
use crate::week::WeekKey;

pub async fn init_db(database_url: &str) -> Result<PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Persistence used by the backup workflow and the browsing endpoints.
///
/// Catalog rows (`tracks`, `artists`) are shared between users and are
/// only ever inserted once; every write to them is conflict-tolerant.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Backups
    // =========================================================================

    async fn find_backup(&self, user_id: &str, week: WeekKey) -> Result<Option<Backup>>;

    /// Insert a backup row. Returns `None` when a backup for the same
    /// `(user, year, week)` already exists.
    async fn insert_backup(&self, backup: &NewBackup) -> Result<Option<Backup>>;

    async fn link_backup_track(&self, backup_id: &str, track_id: &str) -> Result<()>;

    async fn list_backups(&self, user_id: &str) -> Result<Vec<Backup>>;

    async fn backup_by_id(&self, user_id: &str, backup_id: &str) -> Result<Option<Backup>>;

    async fn backup_tracks(&self, backup_id: &str) -> Result<Vec<TrackWithArtists>>;

    async fn count_backups(&self) -> Result<i64>;

    // =========================================================================
    // Credentials and playlist discovery cache
    // =========================================================================

    /// Owner of an unexpired sign-in session.
    async fn session_user(&self, session_token: &str) -> Result<Option<String>>;

    async fn account_for_user(&self, user_id: &str) -> Result<Option<Account>>;

    /// Overwrite the stored token pair for `(spotify, provider_account_id)`.
    async fn update_account_tokens(
        &self,
        provider_account_id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<()>;

    async fn playlist_link(&self, user_id: &str) -> Result<Option<PlaylistLink>>;

    /// Write the user's playlist link if none exists and return the stored
    /// link, which is the earlier one when a link was already present.
    async fn save_playlist_link(&self, user_id: &str, playlist_id: &str) -> Result<PlaylistLink>;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Insert the track if absent. An existing row is returned unchanged.
    async fn upsert_track(&self, track: &Track) -> Result<Track>;

    /// Insert the artist if absent. An existing row is left unchanged.
    async fn upsert_artist(&self, artist: &Artist) -> Result<()>;

    async fn link_track_artist(&self, track_id: &str, artist_id: &str) -> Result<()>;

    async fn artist(&self, artist_id: &str) -> Result<Option<Artist>>;

    /// Set `image_url` only if it is currently empty. Returns whether the
    /// row changed.
    async fn set_artist_image_if_empty(&self, artist_id: &str, image_url: &str) -> Result<bool>;

    // =========================================================================
    // Settings and users
    // =========================================================================

    async fn ensure_settings(&self, user_id: &str) -> Result<UserSettings>;

    async fn toggle_setting(&self, user_id: &str, setting: Setting) -> Result<UserSettings>;

    async fn weekly_backup_users(&self) -> Result<Vec<String>>;

    async fn user_totals(&self, user_id: &str) -> Result<UserTotals>;

    async fn recent_backups(&self, user_id: &str, limit: i64) -> Result<Vec<RecentBackup>>;

    async fn frequent_artists(&self, user_id: &str, limit: i64) -> Result<Vec<ArtistFrequency>>;

    /// Remove the user and everything they own.
    async fn delete_user(&self, user_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const BACKUP_COLUMNS: &str = "id, backup_id, user_id, week, year, created_at";

#[async_trait]
impl Store for PgStore {
    async fn find_backup(&self, user_id: &str, week: WeekKey) -> Result<Option<Backup>> {
        let backup = sqlx::query_as::<_, Backup>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE user_id = $1 AND week = $2 AND year = $3"
        ))
        .bind(user_id)
        .bind(week.week_i32())
        .bind(week.year)
        .fetch_optional(&self.pool)
        .await?;

        Ok(backup)
    }

    async fn insert_backup(&self, backup: &NewBackup) -> Result<Option<Backup>> {
        let inserted = sqlx::query_as::<_, Backup>(&format!(
            r#"
            INSERT INTO backups (backup_id, user_id, week, year)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, year, week) DO NOTHING
            RETURNING {BACKUP_COLUMNS}
            "#
        ))
        .bind(&backup.backup_id)
        .bind(&backup.user_id)
        .bind(backup.week)
        .bind(backup.year)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn link_backup_track(&self, backup_id: &str, track_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_tracks (backup_id, track_id)
            VALUES ($1, $2)
            ON CONFLICT (backup_id, track_id) DO NOTHING
            "#,
        )
        .bind(backup_id)
        .bind(track_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_backups(&self, user_id: &str) -> Result<Vec<Backup>> {
        let backups = sqlx::query_as::<_, Backup>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(backups)
    }

    async fn backup_by_id(&self, user_id: &str, backup_id: &str) -> Result<Option<Backup>> {
        let backup = sqlx::query_as::<_, Backup>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE backup_id = $1 AND user_id = $2"
        ))
        .bind(backup_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(backup)
    }

    async fn backup_tracks(&self, backup_id: &str) -> Result<Vec<TrackWithArtists>> {
        let tracks = sqlx::query_as::<_, Track>(
            r#"
            SELECT t.id, t.name, t.uri, t.cover_art_url, t.colors
            FROM backup_tracks bt
            JOIN tracks t ON t.id = bt.track_id
            WHERE bt.backup_id = $1
            ORDER BY t.name
            "#,
        )
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await?;

        let track_ids: Vec<String> = tracks.iter().map(|t| t.id.clone()).collect();

        let rows = sqlx::query(
            r#"
            SELECT ta.track_id, a.id, a.name, a.uri, a.image_url
            FROM track_artists ta
            JOIN artists a ON a.id = ta.artist_id
            WHERE ta.track_id = ANY($1)
            ORDER BY a.name
            "#,
        )
        .bind(&track_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut artists_by_track: HashMap<String, Vec<Artist>> = HashMap::new();
        for row in rows {
            let track_id: String = row.get("track_id");
            artists_by_track.entry(track_id).or_default().push(Artist {
                id: row.get("id"),
                name: row.get("name"),
                uri: row.get("uri"),
                image_url: row.get("image_url"),
            });
        }

        Ok(tracks
            .into_iter()
            .map(|track| {
                let artists = artists_by_track.remove(&track.id).unwrap_or_default();
                TrackWithArtists { track, artists }
            })
            .collect())
    }

    async fn count_backups(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backups")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn session_user(&self, session_token: &str) -> Result<Option<String>> {
        let user_id: Option<String> = sqlx::query_scalar(
            "SELECT user_id FROM sessions WHERE session_token = $1 AND expires > NOW()",
        )
        .bind(session_token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id)
    }

    async fn account_for_user(&self, user_id: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT user_id, provider, provider_account_id, access_token, refresh_token
            FROM accounts
            WHERE user_id = $1 AND provider = $2
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(PROVIDER)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn update_account_tokens(
        &self,
        provider_account_id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET access_token = $3, refresh_token = $4
            WHERE provider = $1 AND provider_account_id = $2
            "#,
        )
        .bind(PROVIDER)
        .bind(provider_account_id)
        .bind(access_token)
        .bind(refresh_token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no account for provider account {}", provider_account_id);
        }

        Ok(())
    }

    async fn playlist_link(&self, user_id: &str) -> Result<Option<PlaylistLink>> {
        let link = sqlx::query_as::<_, PlaylistLink>(
            "SELECT user_id, discover_weekly_id FROM playlist_links WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    async fn save_playlist_link(&self, user_id: &str, playlist_id: &str) -> Result<PlaylistLink> {
        sqlx::query(
            r#"
            INSERT INTO playlist_links (user_id, discover_weekly_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(playlist_id)
        .execute(&self.pool)
        .await?;

        self.playlist_link(user_id)
            .await?
            .context("playlist link missing after insert")
    }

    async fn upsert_track(&self, track: &Track) -> Result<Track> {
        // The no-op update makes RETURNING yield the stored row on conflict.
        let stored = sqlx::query_as::<_, Track>(
            r#"
            INSERT INTO tracks (id, name, uri, cover_art_url, colors)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET name = tracks.name
            RETURNING id, name, uri, cover_art_url, colors
            "#,
        )
        .bind(&track.id)
        .bind(&track.name)
        .bind(&track.uri)
        .bind(&track.cover_art_url)
        .bind(&track.colors)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn upsert_artist(&self, artist: &Artist) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artists (id, name, uri, image_url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&artist.id)
        .bind(&artist.name)
        .bind(&artist.uri)
        .bind(&artist.image_url)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn link_track_artist(&self, track_id: &str, artist_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO track_artists (track_id, artist_id)
            VALUES ($1, $2)
            ON CONFLICT (track_id, artist_id) DO NOTHING
            "#,
        )
        .bind(track_id)
        .bind(artist_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn artist(&self, artist_id: &str) -> Result<Option<Artist>> {
        let artist = sqlx::query_as::<_, Artist>(
            "SELECT id, name, uri, image_url FROM artists WHERE id = $1",
        )
        .bind(artist_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(artist)
    }

    async fn set_artist_image_if_empty(&self, artist_id: &str, image_url: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE artists SET image_url = $2 WHERE id = $1 AND image_url = ''")
                .bind(artist_id)
                .bind(image_url)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ensure_settings(&self, user_id: &str) -> Result<UserSettings> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (user_id)
            VALUES ($1)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let settings = sqlx::query_as::<_, UserSettings>(
            "SELECT weekly_backup, automatic_sync_to_playlist FROM user_settings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(settings)
    }

    async fn toggle_setting(&self, user_id: &str, setting: Setting) -> Result<UserSettings> {
        self.ensure_settings(user_id).await?;

        let column = setting.column();
        let settings = sqlx::query_as::<_, UserSettings>(&format!(
            r#"
            UPDATE user_settings
            SET {column} = NOT {column}
            WHERE user_id = $1
            RETURNING weekly_backup, automatic_sync_to_playlist
            "#
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(settings)
    }

    async fn weekly_backup_users(&self) -> Result<Vec<String>> {
        let users: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM user_settings WHERE weekly_backup ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    async fn user_totals(&self, user_id: &str) -> Result<UserTotals> {
        let totals = sqlx::query_as::<_, UserTotals>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM backups WHERE user_id = $1) AS total_backups,
                (SELECT COUNT(*)
                   FROM backup_tracks bt
                   JOIN backups b ON b.backup_id = bt.backup_id
                  WHERE b.user_id = $1) AS total_tracks,
                (SELECT COUNT(DISTINCT ta.artist_id)
                   FROM track_artists ta
                   JOIN backup_tracks bt ON bt.track_id = ta.track_id
                   JOIN backups b ON b.backup_id = bt.backup_id
                  WHERE b.user_id = $1) AS total_artists
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(totals)
    }

    async fn recent_backups(&self, user_id: &str, limit: i64) -> Result<Vec<RecentBackup>> {
        let backups = sqlx::query_as::<_, RecentBackup>(
            r#"
            SELECT backup_id, year, week
            FROM backups
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(backups)
    }

    async fn frequent_artists(&self, user_id: &str, limit: i64) -> Result<Vec<ArtistFrequency>> {
        let artists = sqlx::query_as::<_, ArtistFrequency>(
            r#"
            SELECT a.id, a.name, a.image_url, COUNT(*) AS track_count
            FROM artists a
            JOIN track_artists ta ON ta.artist_id = a.id
            WHERE EXISTS (
                SELECT 1
                FROM backup_tracks bt
                JOIN backups b ON b.backup_id = bt.backup_id
                WHERE bt.track_id = ta.track_id AND b.user_id = $1
            )
            GROUP BY a.id, a.name, a.image_url
            ORDER BY track_count DESC, a.name
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(artists)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            tracing::error!("failed to begin transaction: {}", e);
            e
        })?;

        sqlx::query(
            r#"
            DELETE FROM backup_tracks
            WHERE backup_id IN (SELECT backup_id FROM backups WHERE user_id = $1)
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        for statement in [
            "DELETE FROM backups WHERE user_id = $1",
            "DELETE FROM user_settings WHERE user_id = $1",
            "DELETE FROM sessions WHERE user_id = $1",
            "DELETE FROM accounts WHERE user_id = $1",
            "DELETE FROM users WHERE id = $1",
            "DELETE FROM playlist_links WHERE user_id = $1",
        ] {
            sqlx::query(statement)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await.map_err(|e| {
            tracing::error!("failed to commit account deletion: {}", e);
            e
        })?;

        Ok(())
    }
}
