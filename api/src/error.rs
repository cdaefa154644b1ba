use thiserror::Error;

/// Failure talking to the Spotify Web API.
#[derive(Debug, Error)]
pub enum SpotifyApiError {
    /// Non-2xx response. Spotify documents 401, 403 and 429 here but any
    /// status is carried through.
    #[error("spotify returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("spotify request failed: {0}")]
    Transport(String),

    #[error("failed to decode spotify response: {0}")]
    Decode(String),
}

impl SpotifyApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            SpotifyApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SpotifyApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SpotifyApiError::Decode(err.to_string())
        } else {
            SpotifyApiError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenRefreshError {
    #[error("no account or refresh token for user")]
    NoAccount,

    #[error("failed to load account: {0}")]
    Lookup(#[source] anyhow::Error),

    #[error("token endpoint rejected refresh with status {status}")]
    Rejected { status: u16 },

    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error("malformed token response: {0}")]
    Decode(String),

    #[error("failed to persist rotated tokens: {0}")]
    Persist(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to fetch cover art {url}: {reason}")]
    CoverArtFetch { url: String, reason: String },

    #[error("failed to decode cover art: {0}")]
    CoverArtDecode(String),

    #[error("failed to store track {track_id}: {source}")]
    Store {
        track_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Faults inside the reconciler that are not one of its typed outcomes.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("storage error: {0}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to dispatch backup for {user_id}: {reason}")]
    Failed { user_id: String, reason: String },
}
