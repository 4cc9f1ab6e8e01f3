//! Design Automation account nickname (the owner prefix of app bundle and
//! activity ids).

use crate::client::ApsClient;
use crate::error::ApiError;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct ForgeApp {
    nickname: String,
}

/// `GET {da}/forgeapps/me`
pub async fn get_nickname(client: &ApsClient) -> Result<String, ApiError> {
    let req = client
        .authorized(Method::GET, client.endpoints().da(&["forgeapps", "me"]))
        .await?;
    let app: ForgeApp = client.send_json(req).await?;
    Ok(app.nickname)
}

/// Try to set the account nickname and return the one that applies.
///
/// Once an account owns app bundles or activities the service refuses the
/// change with 409; the current nickname is returned in that case.
pub async fn set_nickname(client: &ApsClient, nickname: &str) -> Result<String, ApiError> {
    if nickname.trim().is_empty() {
        return Err(ApiError::Invalid("nickname must not be empty".to_string()));
    }
    let req = client
        .authorized(Method::PATCH, client.endpoints().da(&["forgeapps", "me"]))
        .await?
        .json(&json!({ "nickname": nickname }));

    match client.send(req).await {
        Ok(_) => {
            tracing::info!(nickname, "nickname set");
            Ok(nickname.to_string())
        }
        Err(e) if e.status() == Some(409) => {
            let current = get_nickname(client).await?;
            tracing::warn!(requested = nickname, current = %current, "nickname is locked");
            Ok(current)
        }
        Err(e) => Err(e),
    }
}
