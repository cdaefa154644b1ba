use serde::Serialize;

use crate::fanout::BackupDispatcher;
use crate::models::{ArtistFrequency, RecentBackup, UserTotals};
use crate::Services;

const RECENT_BACKUPS: i64 = 4;
const TOP_ARTISTS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    #[serde(flatten)]
    pub totals: UserTotals,
    pub recent_backups: Vec<RecentBackup>,
    pub most_frequent_artists: Vec<ArtistFrequency>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    /// The user has to point at their playlist by hand.
    pub prompt_user: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<DashboardStats>,
}

impl Dashboard {
    fn prompt() -> Self {
        Self {
            prompt_user: true,
            stats: None,
        }
    }
}

/// First-visit check: make sure the user's playlist is resolved, start a
/// backup when it was only just found, and return their stats.
pub async fn prepare(
    services: &Services,
    dispatcher: &dyn BackupDispatcher,
    user_id: &str,
) -> anyhow::Result<Dashboard> {
    let linked = services.store.playlist_link(user_id).await?.is_some();

    let access_token = match services.tokens.for_user(user_id).await {
        Ok(token) => Some(token),
        Err(e) if linked => {
            tracing::warn!("serving stats for {} without enrichment: {}", user_id, e);
            None
        }
        Err(e) => {
            tracing::warn!("cannot check playlist for {}: {}", user_id, e);
            return Ok(Dashboard::prompt());
        }
    };

    if !linked {
        let Some(token) = access_token.as_deref() else {
            return Ok(Dashboard::prompt());
        };
        if services.locator.locate(user_id, token).await.is_none() {
            return Ok(Dashboard::prompt());
        }

        if let Err(e) = dispatcher.dispatch(user_id).await {
            tracing::error!("{}", e);
        }
    }

    let stats = stats(services, user_id, access_token.as_deref()).await?;
    Ok(Dashboard {
        prompt_user: false,
        stats: Some(stats),
    })
}

pub async fn stats(
    services: &Services,
    user_id: &str,
    access_token: Option<&str>,
) -> anyhow::Result<DashboardStats> {
    let totals = services.store.user_totals(user_id).await?;
    let recent_backups = services.store.recent_backups(user_id, RECENT_BACKUPS).await?;
    let mut most_frequent_artists = services.store.frequent_artists(user_id, TOP_ARTISTS).await?;

    if let Some(token) = access_token {
        most_frequent_artists = services.artists.enrich(token, most_frequent_artists).await;
    }

    Ok(DashboardStats {
        totals,
        recent_backups,
        most_frequent_artists,
    })
}
