use anyhow::{Context, Result};
use std::net::SocketAddr;

/// Name and owner of the playlist that gets archived.
pub const TARGET_PLAYLIST_NAME: &str = "Discover Weekly";
pub const TARGET_PLAYLIST_OWNER: &str = "spotify";

/// Provider key stored on `accounts` rows.
pub const PROVIDER: &str = "spotify";

/// Spotify caps list endpoints at 50 items per page.
pub const PAGE_SIZE: u32 = 50;

pub const DEFAULT_PALETTE_SIZE: usize = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_api_base: String,
    pub spotify_token_url: String,
    /// Single-user backup endpoint targeted by the fan-out. `None` runs
    /// backups in-process instead.
    pub backup_endpoint: Option<String>,
    pub service_token: Option<String>,
    pub palette_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let bind_addr = env_or("BIND_ADDR", "0.0.0.0:3001")
            .parse()
            .context("BIND_ADDR must be a socket address")?;

        let palette_size = match std::env::var("PALETTE_SIZE") {
            Ok(raw) => raw
                .parse()
                .context("PALETTE_SIZE must be a positive integer")?,
            Err(_) => DEFAULT_PALETTE_SIZE,
        };

        let config = Self {
            database_url: env_or("DATABASE_URL", "postgresql://localhost/weekly_archive"),
            bind_addr,
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", ""),
            spotify_client_secret: env_or("SPOTIFY_CLIENT_SECRET", ""),
            spotify_api_base: env_or("SPOTIFY_API_BASE", "https://api.spotify.com/v1"),
            spotify_token_url: env_or(
                "SPOTIFY_TOKEN_URL",
                "https://accounts.spotify.com/api/token",
            ),
            backup_endpoint: env_opt("BACKUP_ENDPOINT"),
            service_token: env_opt("SERVICE_TOKEN"),
            palette_size,
        };

        if config.spotify_client_id.is_empty() || config.spotify_client_secret.is_empty() {
            tracing::warn!(
                "SPOTIFY_CLIENT_ID or SPOTIFY_CLIENT_SECRET not set, token refresh will be rejected"
            );
        }

        Ok(config)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
