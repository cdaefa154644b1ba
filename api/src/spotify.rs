use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SpotifyApiError;

#[derive(Debug, Clone, Deserialize)]
pub struct Paging<T> {
    pub items: Vec<T>,
    pub limit: u32,
    pub offset: u32,
    pub next: Option<String>,
    #[serde(default)]
    pub total: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistOwner {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimplifiedPlaylist {
    pub id: String,
    pub name: String,
    pub owner: PlaylistOwner,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistItem {
    /// Null for items that are no longer available.
    pub track: Option<PlaylistEntry>,
}

/// A playlist slot holds either a track or a podcast episode.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlaylistEntry {
    Track(PlaylistTrack),
    Episode(EpisodeObject),
    #[serde(other)]
    Other,
}

/// A track as it appears in a playlist. Local files come back with a null
/// `id`, and so do their artists.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistTrack {
    pub id: Option<String>,
    pub name: String,
    pub uri: String,
    pub album: AlbumObject,
    pub artists: Vec<PlaylistArtist>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistArtist {
    pub id: Option<String>,
    pub name: String,
    pub uri: Option<String>,
}

impl PlaylistItem {
    /// The catalog track in this slot. Episodes, unavailable items and local
    /// files yield `None`.
    pub fn into_track(self) -> Option<TrackObject> {
        let Some(PlaylistEntry::Track(track)) = self.track else {
            return None;
        };
        let Some(id) = track.id else {
            tracing::debug!("skipping local track {}", track.uri);
            return None;
        };

        let artists = track
            .artists
            .into_iter()
            .filter_map(|artist| {
                Some(SimplifiedArtist {
                    uri: artist.uri?,
                    id: artist.id?,
                    name: artist.name,
                })
            })
            .collect();

        Some(TrackObject {
            id,
            name: track.name,
            uri: track.uri,
            album: track.album,
            artists,
        })
    }
}

impl From<TrackObject> for PlaylistTrack {
    fn from(track: TrackObject) -> Self {
        Self {
            id: Some(track.id),
            name: track.name,
            uri: track.uri,
            album: track.album,
            artists: track
                .artists
                .into_iter()
                .map(|artist| PlaylistArtist {
                    id: Some(artist.id),
                    name: artist.name,
                    uri: Some(artist.uri),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackObject {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub album: AlbumObject,
    pub artists: Vec<SimplifiedArtist>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlbumObject {
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimplifiedArtist {
    pub id: String,
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodeObject {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Image {
    pub url: String,
    pub height: Option<u32>,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtistObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// The parts of the Spotify Web API this service reads.
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    /// `GET /me/playlists`
    async fn my_playlists(
        &self,
        access_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Paging<SimplifiedPlaylist>, SpotifyApiError>;

    /// `GET /playlists/{id}`
    async fn playlist(
        &self,
        access_token: &str,
        playlist_id: &str,
    ) -> Result<SimplifiedPlaylist, SpotifyApiError>;

    /// `GET /playlists/{id}/tracks`
    async fn playlist_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Paging<PlaylistItem>, SpotifyApiError>;

    /// `GET /artists/{id}`
    async fn artist(
        &self,
        access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistObject, SpotifyApiError>;
}

pub struct SpotifyClient {
    http: Client,
    base_url: String,
}

impl SpotifyClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SpotifyApiError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(SpotifyApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl SpotifyApi for SpotifyClient {
    async fn my_playlists(
        &self,
        access_token: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Paging<SimplifiedPlaylist>, SpotifyApiError> {
        self.get_json(
            access_token,
            "/me/playlists",
            &[("limit", limit.to_string()), ("offset", offset.to_string())],
        )
        .await
    }

    async fn playlist(
        &self,
        access_token: &str,
        playlist_id: &str,
    ) -> Result<SimplifiedPlaylist, SpotifyApiError> {
        self.get_json(
            access_token,
            &format!("/playlists/{}", playlist_id),
            &[("fields", "id,name,owner(id)".to_string())],
        )
        .await
    }

    async fn playlist_tracks(
        &self,
        access_token: &str,
        playlist_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Paging<PlaylistItem>, SpotifyApiError> {
        self.get_json(
            access_token,
            &format!("/playlists/{}/tracks", playlist_id),
            &[("limit", limit.to_string()), ("offset", offset.to_string())],
        )
        .await
    }

    async fn artist(
        &self,
        access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistObject, SpotifyApiError> {
        self.get_json(access_token, &format!("/artists/{}", artist_id), &[])
            .await
    }
}
