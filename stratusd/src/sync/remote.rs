use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use stratus_core::{AuthClient, AuthError};
use stratus_core::{ApiError, ApiErrorClass, DriveClient, DriveInfo, Resource, TransferLink};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::{info, warn};

const PAGE_SIZE: u32 = 200;
const TRANSIENT_ROUNDS: u32 = 3;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Drive API facade that applies the retry policy to every call: sleep and
/// retry on rate limits, refresh credentials once on auth failures, retry
/// transient errors a bounded number of rounds, surface everything else.
pub struct Remote {
    client: DriveClient,
    auth: Option<AuthClient>,
    refresh_token: Mutex<Option<String>>,
    cooldown: Duration,
}

impl Remote {
    pub fn new(client: DriveClient, auth: Option<AuthClient>, refresh_token: Option<String>) -> Self {
        Self {
            client,
            auth,
            refresh_token: Mutex::new(refresh_token),
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub async fn drive_info(&self) -> Result<DriveInfo, ApiError> {
        self.with_retries(|| self.client.get_drive_info()).await
    }

    pub async fn get_item(&self, drive_path: &str) -> Result<Resource, ApiError> {
        self.with_retries(|| self.client.get_resource(drive_path)).await
    }

    /// Like [`Remote::get_item`] but a missing item is an answer, not an error.
    pub async fn try_get_item(&self, drive_path: &str) -> Result<Option<Resource>, ApiError> {
        match self.get_item(drive_path).await {
            Ok(item) => Ok(Some(item)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn list_children_all(&self, drive_path: &str) -> Result<Vec<Resource>, ApiError> {
        self.with_retries(|| self.client.list_folder_all(drive_path, PAGE_SIZE))
            .await
    }

    pub async fn create_folder(&self, drive_path: &str) -> Result<Resource, ApiError> {
        self.with_retries(|| self.client.create_folder(drive_path)).await
    }

    /// Moves the item into the trash. An already-gone item counts as deleted.
    pub async fn delete_item(&self, drive_path: &str) -> Result<(), ApiError> {
        match self
            .with_retries(|| self.client.delete_resource(drive_path, false))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn move_item(&self, from: &str, to: &str) -> Result<Resource, ApiError> {
        self.with_retries(|| self.client.move_resource(from, to, false))
            .await
    }

    pub async fn set_modified(&self, drive_path: &str, modified: &str) -> Result<Resource, ApiError> {
        self.with_retries(|| self.client.set_modified(drive_path, modified))
            .await
    }

    pub async fn download_link(&self, drive_path: &str) -> Result<TransferLink, ApiError> {
        self.with_retries(|| self.client.get_download_link(drive_path))
            .await
    }

    pub async fn upload_link(&self, drive_path: &str, overwrite: bool) -> Result<TransferLink, ApiError> {
        self.with_retries(|| self.client.get_upload_link(drive_path, overwrite))
            .await
    }

    pub async fn upload_session(&self, drive_path: &str, size: u64) -> Result<TransferLink, ApiError> {
        self.with_retries(|| self.client.create_upload_session(drive_path, size))
            .await
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut refreshed = false;
        let mut transient_rounds = 0u32;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match err.classification() {
                Some(ApiErrorClass::RateLimit) => {
                    let wait = err
                        .retry_after_secs()
                        .map(Duration::from_secs)
                        .unwrap_or(self.cooldown);
                    warn!(wait_secs = wait.as_secs(), "rate limited, cooling down");
                    tokio::time::sleep(wait).await;
                }
                Some(ApiErrorClass::Auth) if !refreshed => {
                    refreshed = true;
                    match self.refresh_credentials().await {
                        Ok(true) => {}
                        Ok(false) => return Err(err),
                        Err(auth_err) => {
                            warn!(error = %auth_err, "token refresh failed");
                            return Err(err);
                        }
                    }
                }
                Some(ApiErrorClass::Transient) if transient_rounds < TRANSIENT_ROUNDS => {
                    transient_rounds += 1;
                    warn!(error = %err, round = transient_rounds, "transient api error, retrying");
                    tokio::time::sleep(self.cooldown).await;
                }
                _ => return Err(err),
            }
        }
    }

    /// Swaps the access token using the stored refresh token. Returns false
    /// when no auth client or refresh token is configured. The token lock is
    /// held across the exchange so concurrent workers refresh one at a time.
    async fn refresh_credentials(&self) -> Result<bool, AuthError> {
        let Some(auth) = self.auth.as_ref() else {
            return Ok(false);
        };
        let mut guard = self.refresh_token.lock().await;
        let Some(current) = guard.clone() else {
            return Ok(false);
        };
        let grant = auth.refresh_token(&current).await?;
        self.client.set_token(grant.access_token.as_str());
        if let Some(rotated) = grant.refresh_token {
            *guard = Some(rotated);
        }
        info!("access token refreshed");
        Ok(true)
    }
}

pub(crate) fn is_not_found(err: &ApiError) -> bool {
    matches!(err, ApiError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
}

pub(crate) fn parse_modified(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}

pub(crate) fn format_modified(unix: i64) -> Option<String> {
    let parsed = OffsetDateTime::from_unix_timestamp(unix).ok()?;
    parsed.format(&Rfc3339).ok()
}
