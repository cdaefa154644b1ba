use serde::Serialize;
use std::sync::Arc;

use crate::config::{PAGE_SIZE, TARGET_PLAYLIST_NAME, TARGET_PLAYLIST_OWNER};
use crate::db::Store;
use crate::models::PlaylistLink;
use crate::spotify::{SimplifiedPlaylist, SpotifyApi};

fn is_target(playlist: &SimplifiedPlaylist) -> bool {
    playlist.name == TARGET_PLAYLIST_NAME && playlist.owner.id == TARGET_PLAYLIST_OWNER
}

/// Resolves which playlist to archive for a user.
///
/// The first successful discovery is written to `playlist_links` and every
/// later call is answered from there without touching Spotify.
#[derive(Clone)]
pub struct PlaylistLocator {
    store: Arc<dyn Store>,
    spotify: Arc<dyn SpotifyApi>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistValidation {
    pub is_valid: bool,
    pub message: String,
}

impl PlaylistValidation {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManualLink {
    Saved(PlaylistLink),
    Rejected(PlaylistValidation),
}

impl PlaylistLocator {
    pub fn new(store: Arc<dyn Store>, spotify: Arc<dyn SpotifyApi>) -> Self {
        Self { store, spotify }
    }

    /// Return the user's target playlist id, or `None` when it cannot be
    /// found. Upstream and storage failures are logged and reported as `None`.
    pub async fn locate(&self, user_id: &str, access_token: &str) -> Option<String> {
        match self.store.playlist_link(user_id).await {
            Ok(Some(link)) => {
                tracing::debug!("using cached playlist for {}", user_id);
                return Some(link.discover_weekly_id);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("failed to read playlist link for {}: {}", user_id, e);
                return None;
            }
        }

        let playlist_id = self.discover(user_id, access_token).await?;

        match self.store.save_playlist_link(user_id, &playlist_id).await {
            Ok(link) => Some(link.discover_weekly_id),
            Err(e) => {
                tracing::error!("failed to cache playlist link for {}: {}", user_id, e);
                None
            }
        }
    }

    async fn discover(&self, user_id: &str, access_token: &str) -> Option<String> {
        let mut offset = 0;
        let mut pages = 0;

        loop {
            let page = match self
                .spotify
                .my_playlists(access_token, PAGE_SIZE, offset)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(
                        "playlist listing for {} failed at offset {}: {}",
                        user_id,
                        offset,
                        e
                    );
                    return None;
                }
            };
            pages += 1;

            if let Some(found) = page.items.iter().find(|p| is_target(p)) {
                tracing::info!(
                    "found {} for {} after {} page(s)",
                    TARGET_PLAYLIST_NAME,
                    user_id,
                    pages
                );
                return Some(found.id.clone());
            }

            if page.next.is_none() || page.items.is_empty() {
                tracing::warn!(
                    "{} not found for {} in {} page(s)",
                    TARGET_PLAYLIST_NAME,
                    user_id,
                    pages
                );
                return None;
            }

            let step = if page.limit == 0 { PAGE_SIZE } else { page.limit };
            offset = page.offset + step;
        }
    }

    /// Check that `playlist_id` names the target playlist.
    pub async fn validate(&self, access_token: &str, playlist_id: &str) -> PlaylistValidation {
        match self.spotify.playlist(access_token, playlist_id).await {
            Ok(playlist) if is_target(&playlist) => PlaylistValidation {
                is_valid: true,
                message: String::new(),
            },
            Ok(_) => PlaylistValidation::invalid("Invalid playlist"),
            Err(e) => {
                tracing::warn!("failed to fetch playlist {}: {}", playlist_id, e);
                PlaylistValidation::invalid("Error fetching playlist")
            }
        }
    }

    /// Store a playlist the user pointed at by hand, after validating it.
    pub async fn link_manually(
        &self,
        user_id: &str,
        access_token: &str,
        input: &str,
    ) -> anyhow::Result<ManualLink> {
        let Some(playlist_id) = parse_playlist_id(input) else {
            return Ok(ManualLink::Rejected(PlaylistValidation::invalid(
                "Not a playlist link",
            )));
        };

        let validation = self.validate(access_token, &playlist_id).await;
        if !validation.is_valid {
            return Ok(ManualLink::Rejected(validation));
        }

        let link = self.store.save_playlist_link(user_id, &playlist_id).await?;
        tracing::info!("linked playlist {} for {} manually", playlist_id, user_id);
        Ok(ManualLink::Saved(link))
    }
}

/// Accepts a bare id, a `spotify:playlist:` URI or an open.spotify.com link.
pub fn parse_playlist_id(input: &str) -> Option<String> {
    let input = input.trim();

    let id = if let Some(rest) = input.strip_prefix("spotify:playlist:") {
        rest
    } else if let Some(idx) = input.find("/playlist/") {
        let rest = &input[idx + "/playlist/".len()..];
        rest.split(['?', '#', '/']).next().unwrap_or_default()
    } else {
        input
    };

    if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(id.to_string())
    } else {
        None
    }
}
