use futures::future::join_all;
use std::sync::Arc;

use crate::db::Store;
use crate::models::ArtistFrequency;
use crate::spotify::SpotifyApi;

/// Back-fills artist images, which ingestion always stores empty.
#[derive(Clone)]
pub struct ArtistEnricher {
    store: Arc<dyn Store>,
    spotify: Arc<dyn SpotifyApi>,
}

impl ArtistEnricher {
    pub fn new(store: Arc<dyn Store>, spotify: Arc<dyn SpotifyApi>) -> Self {
        Self { store, spotify }
    }

    /// Resolve the stored image for one artist, fetching it from Spotify when
    /// the row has none yet. An image that is already set is never replaced.
    pub async fn backfill(&self, access_token: &str, artist_id: &str) -> anyhow::Result<Option<String>> {
        let Some(artist) = self.store.artist(artist_id).await? else {
            return Ok(None);
        };
        if !artist.image_url.is_empty() {
            return Ok(Some(artist.image_url));
        }

        let remote = self.spotify.artist(access_token, artist_id).await?;
        let Some(image) = remote.images.first() else {
            tracing::debug!("spotify has no image for artist {}", artist_id);
            return Ok(None);
        };

        if self
            .store
            .set_artist_image_if_empty(artist_id, &image.url)
            .await?
        {
            tracing::info!("stored image for artist {}", artist_id);
            return Ok(Some(image.url.clone()));
        }

        // lost to a concurrent back-fill
        Ok(self
            .store
            .artist(artist_id)
            .await?
            .map(|a| a.image_url)
            .filter(|url| !url.is_empty()))
    }

    /// Fill in `image_url` on every entry that lacks one. Failures are logged
    /// and leave the entry as it was.
    pub async fn enrich(
        &self,
        access_token: &str,
        artists: Vec<ArtistFrequency>,
    ) -> Vec<ArtistFrequency> {
        join_all(artists.into_iter().map(|mut artist| async move {
            if artist.image_url.is_empty() {
                match self.backfill(access_token, &artist.id).await {
                    Ok(Some(url)) => artist.image_url = url,
                    Ok(None) => {}
                    Err(e) => tracing::warn!("failed to enrich artist {}: {}", artist.id, e),
                }
            }
            artist
        }))
        .await
    }
}
