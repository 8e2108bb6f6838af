//! OAuth2 authentication for the Gmail API

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use std::env;
use std::path::Path;
use yup_oauth2::ApplicationSecret;

use crate::error::{CategorizerError, Result};

/// Scopes needed to read messages and manage labels
///
/// - gmail.modify: read messages and change their labels (no deletion)
/// - gmail.labels: create labels
pub const REQUIRED_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
];

pub type GmailHub = Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Build an authenticated Gmail hub
///
/// Client credentials come from `credentials_path` when that file exists,
/// otherwise from `GMAIL_CLIENT_ID` / `GMAIL_CLIENT_SECRET`. Tokens are
/// cached at `token_cache_path`; a missing or expired cache opens the
/// browser consent flow.
pub async fn initialize_gmail_hub(
    credentials_path: &Path,
    token_cache_path: &Path,
) -> Result<GmailHub> {
    let secret = if credentials_path.exists() {
        yup_oauth2::read_application_secret(credentials_path)
            .await
            .map_err(|e| CategorizerError::AuthError(format!("Failed to read credentials: {}", e)))?
    } else {
        tracing::debug!(
            "No credentials file at {:?}, trying environment",
            credentials_path
        );
        load_credentials_from_env().map_err(|_| {
            CategorizerError::AuthError(format!(
                "No credentials at {:?} and GMAIL_CLIENT_ID/GMAIL_CLIENT_SECRET not set",
                credentials_path
            ))
        })?
    };

    if let Some(parent) = token_cache_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| CategorizerError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Fetch once up front so the cached token carries every scope before workers start
    auth.token(REQUIRED_SCOPES)
        .await
        .map_err(|e| CategorizerError::AuthError(format!("Failed to obtain token: {}", e)))?;

    if token_cache_path.exists() {
        secure_token_file(token_cache_path).await?;
    }

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| CategorizerError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}

/// Email address of the authenticated account
pub async fn connected_address(hub: &GmailHub) -> Result<String> {
    let (_, profile) = hub
        .users()
        .get_profile("me")
        .add_scope(REQUIRED_SCOPES[0])
        .doit()
        .await?;

    Ok(profile.email_address.unwrap_or_else(|| "unknown".to_string()))
}

/// OAuth2 client credentials from the environment
///
/// - `GMAIL_CLIENT_ID`
/// - `GMAIL_CLIENT_SECRET`
/// - `GMAIL_REDIRECT_URI` (optional, defaults to http://localhost:8080)
pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var("GMAIL_CLIENT_ID")
        .map_err(|_| CategorizerError::ConfigError("GMAIL_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("GMAIL_CLIENT_SECRET")
        .map_err(|_| CategorizerError::ConfigError("GMAIL_CLIENT_SECRET not set".to_string()))?;
    let redirect_uri =
        env::var("GMAIL_REDIRECT_URI").unwrap_or_else(|_| "http://localhost:8080".to_string());

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: "https://oauth2.googleapis.com/token".to_string(),
        redirect_uris: vec![redirect_uri],
        ..Default::default()
    })
}

/// Restrict the token cache to its owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
