//! App bundles: registration, zip upload, versions and aliases.

use crate::client::ApsClient;
use crate::error::ApiError;
use regex::Regex;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// App bundle and activity ids: letters, digits and underscores.
static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Alias ids additionally allow hyphens.
static ALIAS_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

pub(crate) fn validate_id(kind: &str, id: &str) -> Result<(), ApiError> {
    if RESOURCE_ID.is_match(id) {
        Ok(())
    } else {
        Err(ApiError::Invalid(format!(
            "invalid {kind} id '{id}': only letters, digits and '_' are allowed"
        )))
    }
}

pub(crate) fn validate_alias(alias: &str) -> Result<(), ApiError> {
    if ALIAS_ID.is_match(alias) {
        Ok(())
    } else {
        Err(ApiError::Invalid(format!(
            "invalid alias '{alias}': only letters, digits, '_' and '-' are allowed"
        )))
    }
}

/// App bundle definition, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppBundleDefinition {
    pub id: String,
    /// e.g. `Autodesk.Revit+2024`
    pub engine: String,
    pub alias: String,
    /// Path to the `.bundle.zip` archive.
    pub zip: PathBuf,
    #[serde(default)]
    pub description: String,
}

impl AppBundleDefinition {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_id("app bundle", &self.id)?;
        validate_alias(&self.alias)?;
        if self.engine.trim().is_empty() {
            return Err(ApiError::Invalid(format!("app bundle '{}' has no engine", self.id)));
        }
        Ok(())
    }

    /// `{nickname}.{id}+{alias}`, the form activities reference.
    pub fn full_alias(&self, nickname: &str) -> String {
        format!("{nickname}.{}+{}", self.id, self.alias)
    }
}

/// Load an app bundle definition. A relative `zip` resolves against the
/// file's directory.
pub fn load_appbundle_file(path: &Path) -> Result<AppBundleDefinition, ApiError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ApiError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut def: AppBundleDefinition = toml::from_str(&contents)
        .map_err(|e| ApiError::Invalid(format!("failed to parse {}: {e}", path.display())))?;
    if def.zip.is_relative() {
        def.zip = path.parent().unwrap_or(Path::new(".")).join(&def.zip);
    }
    def.validate()?;
    Ok(def)
}

/// Where to send the bundle archive after registering a version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParameters {
    #[serde(rename = "endpointURL")]
    pub endpoint_url: String,
    #[serde(default)]
    pub form_data: BTreeMap<String, String>,
}

/// Response of registering an app bundle or one of its versions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredVersion {
    #[serde(default)]
    pub id: Option<String>,
    pub version: u32,
    pub upload_parameters: UploadParameters,
}

/// Result of [`publish_update`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishSummary {
    pub appbundle_id: String,
    pub new_version: u32,
    pub alias: String,
    pub alias_version: u32,
    pub upload_status: u16,
}

/// `POST {da}/appbundles`
pub async fn register_appbundle(
    client: &ApsClient,
    def: &AppBundleDefinition,
) -> Result<RegisteredVersion, ApiError> {
    def.validate()?;
    let req = client
        .authorized(Method::POST, client.endpoints().da(&["appbundles"]))
        .await?
        .json(&json!({
            "id": def.id,
            "engine": def.engine,
            "description": def.description,
        }));
    client.send_json(req).await
}

/// `POST {da}/appbundles/{id}/versions`
pub async fn create_appbundle_version(
    client: &ApsClient,
    def: &AppBundleDefinition,
) -> Result<RegisteredVersion, ApiError> {
    def.validate()?;
    let req = client
        .authorized(
            Method::POST,
            client.endpoints().da(&["appbundles", &def.id, "versions"]),
        )
        .await?
        .json(&json!({
            "engine": def.engine,
            "description": def.description,
        }));
    client.send_json(req).await
}

/// Multipart POST of the bundle archive to the storage endpoint returned by
/// registration. The form fields must precede the file.
pub async fn upload_appbundle(
    client: &ApsClient,
    upload: &UploadParameters,
    zip: &Path,
) -> Result<u16, ApiError> {
    let bytes = tokio::fs::read(zip).await.map_err(|e| ApiError::Io {
        path: zip.to_path_buf(),
        source: e,
    })?;
    let file_name = zip
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle.zip".to_string());
    let size = bytes.len();

    let mut form = Form::new();
    for (key, value) in &upload.form_data {
        form = form.text(key.clone(), value.clone());
    }
    let part = Part::bytes(bytes)
        .file_name(file_name)
        .mime_str("application/octet-stream")
        .map_err(|e| ApiError::Invalid(format!("invalid mime type: {e}")))?;
    form = form.part("file", part);

    let url = Url::parse(&upload.endpoint_url)
        .map_err(|e| ApiError::Invalid(format!("service returned an invalid upload url: {e}")))?;
    let response = client
        .send(client.unauthorized(Method::POST, url).multipart(form))
        .await?;
    tracing::info!(path = %zip.display(), bytes = size, "uploaded app bundle archive");
    Ok(response.status().as_u16())
}

/// `POST {da}/appbundles/{id}/aliases`
pub async fn create_appbundle_alias(
    client: &ApsClient,
    appbundle_id: &str,
    alias: &str,
    version: u32,
) -> Result<Value, ApiError> {
    validate_alias(alias)?;
    let req = client
        .authorized(
            Method::POST,
            client.endpoints().da(&["appbundles", appbundle_id, "aliases"]),
        )
        .await?
        .json(&json!({ "id": alias, "version": version }));
    client.send_json(req).await
}

/// Point `alias` at `version`, creating the alias if it does not exist.
pub async fn move_or_create_alias(
    client: &ApsClient,
    appbundle_id: &str,
    alias: &str,
    version: u32,
) -> Result<Value, ApiError> {
    validate_alias(alias)?;
    let req = client
        .authorized(
            Method::PATCH,
            client
                .endpoints()
                .da(&["appbundles", appbundle_id, "aliases", alias]),
        )
        .await?
        .json(&json!({ "version": version }));

    match client.send_json(req).await {
        Err(e) if e.status() == Some(404) => {
            tracing::debug!(appbundle = appbundle_id, alias, "alias missing, creating it");
            create_appbundle_alias(client, appbundle_id, alias, version).await
        }
        other => other,
    }
}

/// Register the bundle, upload its archive and alias the first version.
/// Returns the registered version.
pub async fn deploy_appbundle(
    client: &ApsClient,
    def: &AppBundleDefinition,
) -> Result<u32, ApiError> {
    let registered = register_appbundle(client, def).await?;
    upload_appbundle(client, &registered.upload_parameters, &def.zip).await?;
    create_appbundle_alias(client, &def.id, &def.alias, registered.version).await?;
    tracing::info!(
        appbundle = %def.id,
        version = registered.version,
        alias = %def.alias,
        "app bundle deployed"
    );
    Ok(registered.version)
}

/// Publish a new version of an existing bundle and move its alias, so
/// activities bound to the alias pick it up without redeploying.
pub async fn publish_update(
    client: &ApsClient,
    def: &AppBundleDefinition,
) -> Result<PublishSummary, ApiError> {
    let created = create_appbundle_version(client, def).await?;
    let upload_status = upload_appbundle(client, &created.upload_parameters, &def.zip).await?;
    let alias = move_or_create_alias(client, &def.id, &def.alias, created.version).await?;

    let alias_version = alias
        .get("version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(created.version);
    tracing::info!(
        appbundle = %def.id,
        version = created.version,
        alias = %def.alias,
        "app bundle update published"
    );
    Ok(PublishSummary {
        appbundle_id: def.id.clone(),
        new_version: created.version,
        alias: def.alias.clone(),
        alias_version,
        upload_status,
    })
}

/// `DELETE {da}/appbundles/{id}`, removing every version and alias.
pub async fn delete_appbundle(client: &ApsClient, appbundle_id: &str) -> Result<(), ApiError> {
    validate_id("app bundle", appbundle_id)?;
    let req = client
        .authorized(Method::DELETE, client.endpoints().da(&["appbundles", appbundle_id]))
        .await?;
    client.send(req).await?;
    tracing::info!(appbundle = appbundle_id, "app bundle deleted");
    Ok(())
}
