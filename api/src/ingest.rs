use futures::future::try_join_all;
use std::sync::Arc;

use crate::db::Store;
use crate::error::IngestError;
use crate::models::{Artist, Track};
use crate::palette::{self, CoverArtSource};
use crate::spotify::TrackObject;

/// Writes a playlist track into the shared catalog.
///
/// Catalog rows freeze on first insert: a later ingestion of the same track
/// or artist id keeps whatever the first one stored.
#[derive(Clone)]
pub struct TrackIngestor {
    store: Arc<dyn Store>,
    covers: Arc<dyn CoverArtSource>,
    palette_size: usize,
}

impl TrackIngestor {
    pub fn new(store: Arc<dyn Store>, covers: Arc<dyn CoverArtSource>, palette_size: usize) -> Self {
        Self {
            store,
            covers,
            palette_size,
        }
    }

    pub async fn ingest(&self, track: &TrackObject) -> Result<String, IngestError> {
        let cover_art_url = track
            .album
            .images
            .first()
            .map(|img| img.url.clone())
            .unwrap_or_default();

        let colors = if cover_art_url.is_empty() {
            Vec::new()
        } else {
            palette::palette_for(self.covers.as_ref(), &cover_art_url, self.palette_size)
                .await
                .map_err(|e| {
                    tracing::error!("failed to extract colours for track {}: {}", track.id, e);
                    e
                })?
        };

        let store_err = |source: anyhow::Error| IngestError::Store {
            track_id: track.id.clone(),
            source,
        };

        let stored = self
            .store
            .upsert_track(&Track {
                id: track.id.clone(),
                name: track.name.clone(),
                uri: track.uri.clone(),
                cover_art_url,
                colors,
            })
            .await
            .map_err(store_err)?;

        try_join_all(track.artists.iter().map(|artist| async move {
            self.store
                .upsert_artist(&Artist {
                    id: artist.id.clone(),
                    name: artist.name.clone(),
                    uri: artist.uri.clone(),
                    image_url: String::new(),
                })
                .await
        }))
        .await
        .map_err(store_err)?;

        try_join_all(
            track
                .artists
                .iter()
                .map(|artist| self.store.link_track_artist(&stored.id, &artist.id)),
        )
        .await
        .map_err(store_err)?;

        Ok(stored.id)
    }
}
