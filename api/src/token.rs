use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

use crate::db::Store;
use crate::error::TokenRefreshError;

/// Token pair returned by the identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    /// Spotify may omit this when it chooses not to rotate.
    pub refresh_token: Option<String>,
}

/// Exchanges a refresh token for a fresh token pair.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, TokenRefreshError>;
}

pub struct SpotifyTokenEndpoint {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl SpotifyTokenEndpoint {
    pub fn new(
        http: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl TokenEndpoint for SpotifyTokenEndpoint {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, TokenRefreshError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TokenRefreshError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenRefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        response
            .json::<TokenPair>()
            .await
            .map_err(|e| TokenRefreshError::Decode(e.to_string()))
    }
}

/// Rotates a user's stored credentials and hands back a usable access token.
#[derive(Clone)]
pub struct TokenRefresher {
    store: Arc<dyn Store>,
    endpoint: Arc<dyn TokenEndpoint>,
}

impl TokenRefresher {
    pub fn new(store: Arc<dyn Store>, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self { store, endpoint }
    }

    /// Load the user's stored account and refresh its tokens.
    pub async fn for_user(&self, user_id: &str) -> Result<String, TokenRefreshError> {
        let account = self
            .store
            .account_for_user(user_id)
            .await
            .map_err(TokenRefreshError::Lookup)?;

        let Some((account, refresh_token)) =
            account.and_then(|a| a.refresh_token.clone().map(|t| (a, t)))
        else {
            tracing::warn!("no account or refresh token for {}", user_id);
            return Err(TokenRefreshError::NoAccount);
        };

        self.refresh(&account.provider_account_id, &refresh_token)
            .await
    }

    /// Exchange `refresh_token` and persist the rotated pair on the account
    /// identified by `provider_account_id`. The old refresh token must not be
    /// reused after this returns.
    pub async fn refresh(
        &self,
        provider_account_id: &str,
        refresh_token: &str,
    ) -> Result<String, TokenRefreshError> {
        let pair = self.endpoint.exchange(refresh_token).await.map_err(|e| {
            tracing::error!("token refresh for {} failed: {}", provider_account_id, e);
            e
        })?;

        let next_refresh = pair.refresh_token.as_deref().unwrap_or(refresh_token);

        self.store
            .update_account_tokens(provider_account_id, &pair.access_token, next_refresh)
            .await
            .map_err(TokenRefreshError::Persist)?;

        tracing::debug!("rotated tokens for {}", provider_account_id);
        Ok(pair.access_token)
    }
}
