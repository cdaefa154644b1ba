use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

pub mod backup;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod enrich;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod models;
pub mod palette;
pub mod playlist;
pub mod session;
pub mod spotify;
pub mod token;
pub mod week;

#[cfg(test)]
pub(crate) mod test_support;

use backup::{BackupResponse, Reconciler};
use config::Config;
use db::{PgStore, Store};
use enrich::ArtistEnricher;
use fanout::BackupDispatcher;
use ingest::TrackIngestor;
use models::{Backup, BackupDetail, Setting, UserSettings};
use palette::{CoverArtSource, HttpCoverArt};
use playlist::{parse_playlist_id, ManualLink, PlaylistLocator, PlaylistValidation};
use session::{bearer_token, CurrentUser};
use spotify::{SpotifyApi, SpotifyClient};
use token::{SpotifyTokenEndpoint, TokenEndpoint, TokenRefresher};

/// The workflow components, wired to one store and one set of upstreams.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub spotify: Arc<dyn SpotifyApi>,
    pub tokens: TokenRefresher,
    pub locator: PlaylistLocator,
    pub reconciler: Reconciler,
    pub artists: ArtistEnricher,
}

impl Services {
    pub fn new(
        store: Arc<dyn Store>,
        spotify: Arc<dyn SpotifyApi>,
        token_endpoint: Arc<dyn TokenEndpoint>,
        covers: Arc<dyn CoverArtSource>,
        palette_size: usize,
    ) -> Self {
        let tokens = TokenRefresher::new(store.clone(), token_endpoint);
        let locator = PlaylistLocator::new(store.clone(), spotify.clone());
        let ingestor = TrackIngestor::new(store.clone(), covers, palette_size);
        let reconciler = Reconciler::new(
            store.clone(),
            spotify.clone(),
            tokens.clone(),
            locator.clone(),
            ingestor,
        );
        let artists = ArtistEnricher::new(store.clone(), spotify.clone());

        Self {
            store,
            spotify,
            tokens,
            locator,
            reconciler,
            artists,
        }
    }

    /// Connect to Postgres (running migrations) and the real Spotify endpoints.
    pub async fn connect(config: &Config, http: Client) -> anyhow::Result<Self> {
        let pool = db::init_db(&config.database_url).await?;
        tracing::info!("database initialized");

        Ok(Self::new(
            Arc::new(PgStore::new(pool)),
            Arc::new(SpotifyClient::new(http.clone(), &config.spotify_api_base)),
            Arc::new(SpotifyTokenEndpoint::new(
                http.clone(),
                &config.spotify_token_url,
                &config.spotify_client_id,
                &config.spotify_client_secret,
            )),
            Arc::new(HttpCoverArt::new(http)),
            config.palette_size,
        ))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub dispatcher: Arc<dyn BackupDispatcher>,
    pub service_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistRequest {
    playlist_id: String,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    setting: Setting,
}

fn internal_error(context: &str) -> impl FnOnce(anyhow::Error) -> StatusCode + '_ {
    move |e| {
        tracing::error!("{}: {:#}", context, e);
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_body(message: impl Into<String>) -> Json<BackupResponse> {
    Json(BackupResponse::Error {
        error: message.into(),
    })
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = state.service_token.as_deref() else {
        return Ok(());
    };

    if bearer_token(headers) == Some(expected) {
        Ok(())
    } else {
        tracing::warn!("rejected backup request without a valid service token");
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn trigger_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;

    // missing, empty or non-string userId is a plain-text 400
    let user_id = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("userId").and_then(|u| u.as_str()).map(str::to_string))
        .filter(|u| !u.is_empty());

    let Some(user_id) = user_id else {
        return Ok((StatusCode::BAD_REQUEST, "Missing userId").into_response());
    };

    match state.services.reconciler.run(&user_id).await {
        Ok(outcome) => Ok(Json(BackupResponse::from(outcome)).into_response()),
        Err(e) => {
            tracing::error!("backup for {} failed: {}", user_id, e);
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("Error backing up playlist"),
            )
                .into_response())
        }
    }
}

async fn trigger_backup_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;

    match fanout::run_weekly(state.services.store.as_ref(), state.dispatcher.as_ref()).await {
        Ok(summary) => Ok(format!("Backup triggered for {} users", summary.dispatched).into_response()),
        Err(e) => {
            tracing::error!("weekly fan-out failed: {:#}", e);
            Ok((StatusCode::INTERNAL_SERVER_ERROR, "Error triggering backups").into_response())
        }
    }
}

async fn list_backups(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<Backup>>, StatusCode> {
    let backups = state
        .services
        .store
        .list_backups(&user_id)
        .await
        .map_err(internal_error("failed to list backups"))?;

    Ok(Json(backups))
}

async fn count_backups(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let count = state
        .services
        .store
        .count_backups()
        .await
        .map_err(internal_error("failed to count backups"))?;

    Ok(Json(serde_json::json!({ "count": count })))
}

async fn get_backup(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(backup_id): Path<String>,
) -> Result<Json<BackupDetail>, StatusCode> {
    let store = &state.services.store;

    let backup = store
        .backup_by_id(&user_id, &backup_id)
        .await
        .map_err(internal_error("failed to load backup"))?
        .ok_or(StatusCode::NOT_FOUND)?;

    let tracks = store
        .backup_tracks(&backup.backup_id)
        .await
        .map_err(internal_error("failed to load backup tracks"))?;

    Ok(Json(BackupDetail { backup, tracks }))
}

async fn get_dashboard(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<dashboard::Dashboard>, StatusCode> {
    let dashboard = dashboard::prepare(&state.services, state.dispatcher.as_ref(), &user_id)
        .await
        .map_err(internal_error("failed to prepare dashboard"))?;

    Ok(Json(dashboard))
}

async fn validate_playlist(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<PlaylistRequest>,
) -> Json<PlaylistValidation> {
    let Some(playlist_id) = parse_playlist_id(&request.playlist_id) else {
        return Json(PlaylistValidation::invalid("Not a playlist link"));
    };

    let token = match state.services.tokens.for_user(&user_id).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!("cannot validate playlist for {}: {}", user_id, e);
            return Json(PlaylistValidation::invalid("No account found"));
        }
    };

    Json(state.services.locator.validate(&token, &playlist_id).await)
}

async fn save_playlist(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<PlaylistRequest>,
) -> Result<Response, StatusCode> {
    let token = match state.services.tokens.for_user(&user_id).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!("cannot save playlist for {}: {}", user_id, e);
            return Ok(error_body("No account found").into_response());
        }
    };

    let linked = state
        .services
        .locator
        .link_manually(&user_id, &token, &request.playlist_id)
        .await
        .map_err(internal_error("failed to save playlist link"))?;

    Ok(match linked {
        ManualLink::Saved(link) => Json(link).into_response(),
        ManualLink::Rejected(validation) => error_body(validation.message).into_response(),
    })
}

async fn get_settings(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<UserSettings>, StatusCode> {
    let settings = state
        .services
        .store
        .ensure_settings(&user_id)
        .await
        .map_err(internal_error("failed to load settings"))?;

    Ok(Json(settings))
}

async fn toggle_setting(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<ToggleRequest>,
) -> Result<Json<bool>, StatusCode> {
    let settings = state
        .services
        .store
        .toggle_setting(&user_id, request.setting)
        .await
        .map_err(internal_error("failed to toggle setting"))?;

    tracing::info!(
        "{} set {} to {}",
        user_id,
        request.setting.column(),
        request.setting.get(&settings)
    );
    Ok(Json(request.setting.get(&settings)))
}

async fn delete_account(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<StatusCode, StatusCode> {
    state
        .services
        .store
        .delete_user(&user_id)
        .await
        .map_err(internal_error("failed to delete account"))?;

    tracing::info!("deleted account {}", user_id);
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/backup", post(trigger_backup))
        .route("/api/backup-all", post(trigger_backup_all))
        .route("/api/backups", get(list_backups))
        .route("/api/backups/count", get(count_backups))
        .route("/api/backups/:backup_id", get(get_backup))
        .route("/api/dashboard", get(get_dashboard))
        .route("/api/playlist", post(save_playlist))
        .route("/api/playlist/validate", post(validate_playlist))
        .route("/api/settings", get(get_settings))
        .route("/api/settings/toggle", post(toggle_setting))
        .route("/api/account", delete(delete_account))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("weekly_archive_api=debug,tower_http=debug")),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    let http = Client::new();
    let services = Services::connect(&config, http.clone()).await?;

    let dispatcher = fanout::dispatcher_for(
        config.backup_endpoint.as_deref(),
        config.service_token.clone(),
        http,
        services.reconciler.clone(),
    );

    let state = AppState {
        services,
        dispatcher: dispatcher.clone(),
        service_token: config.service_token.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", config.bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("waiting for dispatched backups to finish");
    dispatcher.wait_idle().await;
    Ok(())
}
