//! In-memory fakes for the storage and upstream seams, plus fixture builders.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use image::{ImageFormat, Rgba, RgbaImage};
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::PROVIDER;
use crate::db::Store;
use crate::error::{IngestError, SpotifyApiError, TokenRefreshError};
use crate::models::{
    Account, Artist, ArtistFrequency, Backup, NewBackup, PlaylistLink, RecentBackup, Setting,
    Track, TrackWithArtists, UserSettings, UserTotals,
};
use crate::palette::CoverArtSource;
use crate::spotify::{
    AlbumObject, ArtistObject, EpisodeObject, Image, Paging, PlaylistArtist, PlaylistEntry,
    PlaylistItem, PlaylistOwner, PlaylistTrack, SimplifiedArtist, SimplifiedPlaylist, SpotifyApi,
    TrackObject,
};
use crate::token::{TokenEndpoint, TokenPair};
use crate::week::WeekKey;

#[derive(Default)]
struct State {
    users: BTreeSet<String>,
    accounts: Vec<Account>,
    sessions: HashMap<String, (String, DateTime<Utc>)>,
    settings: HashMap<String, UserSettings>,
    links: HashMap<String, PlaylistLink>,
    backups: Vec<Backup>,
    backup_tracks: BTreeSet<(String, String)>,
    tracks: HashMap<String, Track>,
    artists: HashMap<String, Artist>,
    track_artists: BTreeSet<(String, String)>,
    next_id: i64,
}

impl State {
    fn user_track_ids(&self, user_id: &str) -> BTreeSet<String> {
        let backup_ids: BTreeSet<&str> = self
            .backups
            .iter()
            .filter(|b| b.user_id == user_id)
            .map(|b| b.backup_id.as_str())
            .collect();

        self.backup_tracks
            .iter()
            .filter(|(b, _)| backup_ids.contains(b.as_str()))
            .map(|(_, t)| t.clone())
            .collect()
    }
}

/// `Store` backed by a mutex-guarded map set. Mirrors the write-once and
/// uniqueness rules of the Postgres schema.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    stale_backup_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Create a user with a Spotify account (`spotify-{id}`) and default settings.
    pub fn add_user(&self, user_id: &str, refresh_token: Option<&str>) {
        let mut state = self.state();
        state.users.insert(user_id.to_string());
        state.accounts.push(Account {
            user_id: user_id.to_string(),
            provider: PROVIDER.to_string(),
            provider_account_id: format!("spotify-{user_id}"),
            access_token: None,
            refresh_token: refresh_token.map(str::to_string),
        });
        state
            .settings
            .insert(user_id.to_string(), UserSettings::default());
    }

    /// Sign `user_id` in with `session_token`, valid for a day.
    pub fn add_session(&self, user_id: &str, session_token: &str) {
        self.add_session_expiring(user_id, session_token, Utc::now() + Duration::days(1));
    }

    pub fn add_session_expiring(&self, user_id: &str, session_token: &str, expires: DateTime<Utc>) {
        self.state()
            .sessions
            .insert(session_token.to_string(), (user_id.to_string(), expires));
    }

    /// Make the next `reads` calls to `find_backup` miss, as a concurrent run
    /// that has not yet seen the other writer's row would.
    pub fn miss_backup_reads(&self, reads: usize) {
        self.stale_backup_reads.store(reads, Ordering::SeqCst);
    }

    pub fn track(&self, track_id: &str) -> Option<Track> {
        self.state().tracks.get(track_id).cloned()
    }

    pub fn track_artist_ids(&self, track_id: &str) -> Vec<String> {
        self.state()
            .track_artists
            .iter()
            .filter(|(t, _)| t == track_id)
            .map(|(_, a)| a.clone())
            .collect()
    }

    pub fn backup_track_ids(&self, backup_id: &str) -> Vec<String> {
        self.state()
            .backup_tracks
            .iter()
            .filter(|(b, _)| b == backup_id)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn backups_for(&self, user_id: &str) -> Vec<Backup> {
        self.state()
            .backups
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.state().users.contains(user_id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_backup(&self, user_id: &str, week: WeekKey) -> Result<Option<Backup>> {
        if self
            .stale_backup_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }
        Ok(self
            .state()
            .backups
            .iter()
            .find(|b| b.user_id == user_id && b.year == week.year && b.week == week.week_i32())
            .cloned())
    }

    async fn insert_backup(&self, backup: &NewBackup) -> Result<Option<Backup>> {
        let mut state = self.state();
        if state
            .backups
            .iter()
            .any(|b| b.user_id == backup.user_id && b.year == backup.year && b.week == backup.week)
        {
            return Ok(None);
        }
        if state.backups.iter().any(|b| b.backup_id == backup.backup_id) {
            bail!("duplicate backup_id {}", backup.backup_id);
        }

        state.next_id += 1;
        let row = Backup {
            id: state.next_id,
            backup_id: backup.backup_id.clone(),
            user_id: backup.user_id.clone(),
            week: backup.week,
            year: backup.year,
            created_at: Utc::now(),
        };
        state.backups.push(row.clone());
        Ok(Some(row))
    }

    async fn link_backup_track(&self, backup_id: &str, track_id: &str) -> Result<()> {
        let mut state = self.state();
        if !state.tracks.contains_key(track_id) {
            bail!("foreign key violation: track {}", track_id);
        }
        state
            .backup_tracks
            .insert((backup_id.to_string(), track_id.to_string()));
        Ok(())
    }

    async fn list_backups(&self, user_id: &str) -> Result<Vec<Backup>> {
        let mut backups = self.backups_for(user_id);
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(backups)
    }

    async fn backup_by_id(&self, user_id: &str, backup_id: &str) -> Result<Option<Backup>> {
        Ok(self
            .state()
            .backups
            .iter()
            .find(|b| b.backup_id == backup_id && b.user_id == user_id)
            .cloned())
    }

    async fn backup_tracks(&self, backup_id: &str) -> Result<Vec<TrackWithArtists>> {
        let state = self.state();
        let mut tracks: Vec<TrackWithArtists> = state
            .backup_tracks
            .iter()
            .filter(|(b, _)| b == backup_id)
            .filter_map(|(_, t)| state.tracks.get(t).cloned())
            .map(|track| {
                let mut artists: Vec<Artist> = state
                    .track_artists
                    .iter()
                    .filter(|(t, _)| *t == track.id)
                    .filter_map(|(_, a)| state.artists.get(a).cloned())
                    .collect();
                artists.sort_by(|a, b| a.name.cmp(&b.name));
                TrackWithArtists { track, artists }
            })
            .collect();
        tracks.sort_by(|a, b| a.track.name.cmp(&b.track.name));
        Ok(tracks)
    }

    async fn count_backups(&self) -> Result<i64> {
        Ok(self.state().backups.len() as i64)
    }

    async fn session_user(&self, session_token: &str) -> Result<Option<String>> {
        Ok(self
            .state()
            .sessions
            .get(session_token)
            .filter(|(_, expires)| *expires > Utc::now())
            .map(|(user_id, _)| user_id.clone()))
    }

    async fn account_for_user(&self, user_id: &str) -> Result<Option<Account>> {
        Ok(self
            .state()
            .accounts
            .iter()
            .find(|a| a.user_id == user_id && a.provider == PROVIDER)
            .cloned())
    }

    async fn update_account_tokens(
        &self,
        provider_account_id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<()> {
        let mut state = self.state();
        let Some(account) = state
            .accounts
            .iter_mut()
            .find(|a| a.provider_account_id == provider_account_id)
        else {
            bail!("no account for provider account {}", provider_account_id);
        };
        account.access_token = Some(access_token.to_string());
        account.refresh_token = Some(refresh_token.to_string());
        Ok(())
    }

    async fn playlist_link(&self, user_id: &str) -> Result<Option<PlaylistLink>> {
        Ok(self.state().links.get(user_id).cloned())
    }

    async fn save_playlist_link(&self, user_id: &str, playlist_id: &str) -> Result<PlaylistLink> {
        Ok(self
            .state()
            .links
            .entry(user_id.to_string())
            .or_insert_with(|| PlaylistLink {
                user_id: user_id.to_string(),
                discover_weekly_id: playlist_id.to_string(),
            })
            .clone())
    }

    async fn upsert_track(&self, track: &Track) -> Result<Track> {
        Ok(self
            .state()
            .tracks
            .entry(track.id.clone())
            .or_insert_with(|| track.clone())
            .clone())
    }

    async fn upsert_artist(&self, artist: &Artist) -> Result<()> {
        self.state()
            .artists
            .entry(artist.id.clone())
            .or_insert_with(|| artist.clone());
        Ok(())
    }

    async fn link_track_artist(&self, track_id: &str, artist_id: &str) -> Result<()> {
        self.state()
            .track_artists
            .insert((track_id.to_string(), artist_id.to_string()));
        Ok(())
    }

    async fn artist(&self, artist_id: &str) -> Result<Option<Artist>> {
        Ok(self.state().artists.get(artist_id).cloned())
    }

    async fn set_artist_image_if_empty(&self, artist_id: &str, image_url: &str) -> Result<bool> {
        let mut state = self.state();
        match state.artists.get_mut(artist_id) {
            Some(artist) if artist.image_url.is_empty() => {
                artist.image_url = image_url.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ensure_settings(&self, user_id: &str) -> Result<UserSettings> {
        Ok(*self
            .state()
            .settings
            .entry(user_id.to_string())
            .or_default())
    }

    async fn toggle_setting(&self, user_id: &str, setting: Setting) -> Result<UserSettings> {
        let mut state = self.state();
        let settings = state.settings.entry(user_id.to_string()).or_default();
        match setting {
            Setting::WeeklyBackup => settings.weekly_backup = !settings.weekly_backup,
            Setting::AutomaticSyncToPlaylist => {
                settings.automatic_sync_to_playlist = !settings.automatic_sync_to_playlist
            }
        }
        Ok(*settings)
    }

    async fn weekly_backup_users(&self) -> Result<Vec<String>> {
        let mut users: Vec<String> = self
            .state()
            .settings
            .iter()
            .filter(|(_, s)| s.weekly_backup)
            .map(|(u, _)| u.clone())
            .collect();
        users.sort();
        Ok(users)
    }

    async fn user_totals(&self, user_id: &str) -> Result<UserTotals> {
        let state = self.state();
        let backup_ids: BTreeSet<&str> = state
            .backups
            .iter()
            .filter(|b| b.user_id == user_id)
            .map(|b| b.backup_id.as_str())
            .collect();
        let total_tracks = state
            .backup_tracks
            .iter()
            .filter(|(b, _)| backup_ids.contains(b.as_str()))
            .count();
        let track_ids = state.user_track_ids(user_id);
        let artists: BTreeSet<&String> = state
            .track_artists
            .iter()
            .filter(|(t, _)| track_ids.contains(t))
            .map(|(_, a)| a)
            .collect();

        Ok(UserTotals {
            total_backups: backup_ids.len() as i64,
            total_tracks: total_tracks as i64,
            total_artists: artists.len() as i64,
        })
    }

    async fn recent_backups(&self, user_id: &str, limit: i64) -> Result<Vec<RecentBackup>> {
        Ok(self
            .list_backups(user_id)
            .await?
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|b| RecentBackup {
                backup_id: b.backup_id,
                year: b.year,
                week: b.week,
            })
            .collect())
    }

    async fn frequent_artists(&self, user_id: &str, limit: i64) -> Result<Vec<ArtistFrequency>> {
        let state = self.state();
        let track_ids = state.user_track_ids(user_id);

        let mut counts: HashMap<&str, i64> = HashMap::new();
        for (track_id, artist_id) in &state.track_artists {
            if track_ids.contains(track_id) {
                *counts.entry(artist_id.as_str()).or_default() += 1;
            }
        }

        let mut artists: Vec<ArtistFrequency> = counts
            .into_iter()
            .filter_map(|(id, track_count)| {
                state.artists.get(id).map(|a| ArtistFrequency {
                    id: a.id.clone(),
                    name: a.name.clone(),
                    image_url: a.image_url.clone(),
                    track_count,
                })
            })
            .collect();
        artists.sort_by(|a, b| b.track_count.cmp(&a.track_count).then(a.name.cmp(&b.name)));
        artists.truncate(limit.max(0) as usize);
        Ok(artists)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        let mut state = self.state();
        let backup_ids: BTreeSet<String> = state
            .backups
            .iter()
            .filter(|b| b.user_id == user_id)
            .map(|b| b.backup_id.clone())
            .collect();
        state.backup_tracks.retain(|(b, _)| !backup_ids.contains(b));
        state.backups.retain(|b| b.user_id != user_id);
        state.settings.remove(user_id);
        state.sessions.retain(|_, (owner, _)| owner != user_id);
        state.accounts.retain(|a| a.user_id != user_id);
        state.users.remove(user_id);
        state.links.remove(user_id);
        Ok(())
    }
}

/// Scripted Spotify Web API.
#[derive(Default)]
pub struct MockSpotify {
    playlist_pages: Vec<Vec<SimplifiedPlaylist>>,
    failing_page: Option<(usize, u16)>,
    playlists: HashMap<String, SimplifiedPlaylist>,
    tracks: HashMap<String, Vec<PlaylistItem>>,
    failing_tracks: Option<u16>,
    artists: HashMap<String, ArtistObject>,
    playlist_page_requests: AtomicUsize,
    track_requests: AtomicUsize,
    artist_requests: AtomicUsize,
}

fn not_found() -> SpotifyApiError {
    SpotifyApiError::Status {
        status: 404,
        message: "Not found".to_string(),
    }
}

impl MockSpotify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_playlist_pages(mut self, pages: Vec<Vec<SimplifiedPlaylist>>) -> Self {
        self.playlist_pages = pages;
        self
    }

    pub fn failing_playlist_page(mut self, index: usize, status: u16) -> Self {
        self.failing_page = Some((index, status));
        self
    }

    pub fn with_playlist(mut self, playlist: SimplifiedPlaylist) -> Self {
        self.playlists.insert(playlist.id.clone(), playlist);
        self
    }

    /// Serve a single Discover Weekly on the first playlist page with these items.
    pub fn with_discover_weekly(self, playlist_id: &str, items: Vec<PlaylistItem>) -> Self {
        self.with_playlist_pages(vec![vec![playlist(
            playlist_id,
            "Discover Weekly",
            "spotify",
        )]])
        .with_tracks(playlist_id, items)
    }

    pub fn with_tracks(mut self, playlist_id: &str, items: Vec<PlaylistItem>) -> Self {
        self.tracks.insert(playlist_id.to_string(), items);
        self
    }

    pub fn failing_tracks(mut self, status: u16) -> Self {
        self.failing_tracks = Some(status);
        self
    }

    pub fn with_artist(mut self, artist_id: &str, image_url: Option<&str>) -> Self {
        self.artists.insert(
            artist_id.to_string(),
            ArtistObject {
                id: artist_id.to_string(),
                name: format!("Artist {artist_id}"),
                images: image_url.into_iter().map(cover_image).collect(),
            },
        );
        self
    }

    pub fn playlist_page_requests(&self) -> usize {
        self.playlist_page_requests.load(Ordering::SeqCst)
    }

    pub fn track_requests(&self) -> usize {
        self.track_requests.load(Ordering::SeqCst)
    }

    pub fn artist_requests(&self) -> usize {
        self.artist_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpotifyApi for MockSpotify {
    async fn my_playlists(
        &self,
        _access_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Paging<SimplifiedPlaylist>, SpotifyApiError> {
        self.playlist_page_requests.fetch_add(1, Ordering::SeqCst);
        let index = (offset / limit.max(1)) as usize;

        if let Some((failing, status)) = self.failing_page {
            if failing == index {
                return Err(SpotifyApiError::Status {
                    status,
                    message: "scripted failure".to_string(),
                });
            }
        }

        let items = self.playlist_pages.get(index).cloned().unwrap_or_default();
        let next = (index + 1 < self.playlist_pages.len()).then(|| {
            format!(
                "https://api.spotify.com/v1/me/playlists?offset={}",
                offset + limit
            )
        });
        Ok(Paging {
            items,
            limit,
            offset,
            next,
            total: self.playlist_pages.iter().map(Vec::len).sum::<usize>() as u32,
        })
    }

    async fn playlist(
        &self,
        _access_token: &str,
        playlist_id: &str,
    ) -> Result<SimplifiedPlaylist, SpotifyApiError> {
        self.playlists.get(playlist_id).cloned().ok_or_else(not_found)
    }

    async fn playlist_tracks(
        &self,
        _access_token: &str,
        playlist_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Paging<PlaylistItem>, SpotifyApiError> {
        self.track_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.failing_tracks {
            return Err(SpotifyApiError::Status {
                status,
                message: "scripted failure".to_string(),
            });
        }

        let items = self.tracks.get(playlist_id).cloned().ok_or_else(not_found)?;
        Ok(Paging {
            total: items.len() as u32,
            items: items.into_iter().take(limit as usize).collect(),
            limit,
            offset,
            next: None,
        })
    }

    async fn artist(
        &self,
        _access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistObject, SpotifyApiError> {
        self.artist_requests.fetch_add(1, Ordering::SeqCst);
        self.artists.get(artist_id).cloned().ok_or_else(not_found)
    }
}

/// Token endpoint that either always issues the same pair or always rejects.
pub struct MockTokens {
    outcome: Result<TokenPair, u16>,
    calls: Mutex<Vec<String>>,
}

impl MockTokens {
    pub fn issuing(access_token: &str, refresh_token: Option<&str>) -> Self {
        Self {
            outcome: Ok(TokenPair {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.map(str::to_string),
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(status: u16) -> Self {
        Self {
            outcome: Err(status),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenEndpoint for MockTokens {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, TokenRefreshError> {
        self.calls.lock().unwrap().push(refresh_token.to_string());
        match &self.outcome {
            Ok(pair) => Ok(pair.clone()),
            Err(status) => Err(TokenRefreshError::Rejected { status: *status }),
        }
    }
}

/// Cover art source serving one flat colour, or failing every fetch.
#[derive(Clone)]
pub struct MockCoverArt {
    colour: Option<[u8; 3]>,
    fetches: Arc<AtomicUsize>,
}

impl MockCoverArt {
    pub fn solid(colour: [u8; 3]) -> Self {
        Self {
            colour: Some(colour),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            colour: None,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoverArtSource for MockCoverArt {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, IngestError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.colour {
            Some([r, g, b]) => Ok(png_bytes(4, 4, |_, _| [r, g, b, 255])),
            None => Err(IngestError::CoverArtFetch {
                url: url.to_string(),
                reason: "HTTP 500".to_string(),
            }),
        }
    }
}

pub fn playlist(id: &str, name: &str, owner: &str) -> SimplifiedPlaylist {
    SimplifiedPlaylist {
        id: id.to_string(),
        name: name.to_string(),
        owner: PlaylistOwner {
            id: owner.to_string(),
        },
    }
}

fn cover_image(url: &str) -> Image {
    Image {
        url: url.to_string(),
        height: Some(640),
        width: Some(640),
    }
}

pub fn track_object(
    id: &str,
    name: &str,
    artist_ids: &[&str],
    cover_art_url: Option<&str>,
) -> TrackObject {
    TrackObject {
        id: id.to_string(),
        name: name.to_string(),
        uri: format!("spotify:track:{id}"),
        album: AlbumObject {
            images: cover_art_url.into_iter().map(cover_image).collect(),
        },
        artists: artist_ids
            .iter()
            .map(|a| SimplifiedArtist {
                id: a.to_string(),
                name: format!("Artist {a}"),
                uri: format!("spotify:artist:{a}"),
            })
            .collect(),
    }
}

pub fn track_item(track: TrackObject) -> PlaylistItem {
    PlaylistItem {
        track: Some(PlaylistEntry::Track(track.into())),
    }
}

/// A local file: Spotify sends it with null track and artist ids.
pub fn local_track_item(name: &str) -> PlaylistItem {
    PlaylistItem {
        track: Some(PlaylistEntry::Track(PlaylistTrack {
            id: None,
            name: name.to_string(),
            uri: format!("spotify:local:::{name}:200"),
            album: AlbumObject { images: Vec::new() },
            artists: vec![PlaylistArtist {
                id: None,
                name: "Unknown".to_string(),
                uri: None,
            }],
        })),
    }
}

pub fn episode_item(id: &str) -> PlaylistItem {
    PlaylistItem {
        track: Some(PlaylistEntry::Episode(EpisodeObject {
            id: id.to_string(),
            name: format!("Episode {id}"),
        })),
    }
}

pub fn png_bytes(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| Rgba(pixel(x, y)));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// An 8px wide PNG made of horizontal bands, `rows` pixels tall each.
pub fn striped_png(bands: &[([u8; 3], u32)]) -> Vec<u8> {
    let height: u32 = bands.iter().map(|(_, rows)| rows).sum();
    png_bytes(8, height, |_, y| {
        let mut top = 0;
        for ([r, g, b], rows) in bands {
            if y < top + rows {
                return [*r, *g, *b, 255];
            }
            top += rows;
        }
        [0, 0, 0, 255]
    })
}
