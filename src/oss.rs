//! Object Storage Service (OSS v2): buckets and signed S3 transfers.

use crate::client::ApsClient;
use crate::descriptor::ObjectLocation;
use crate::error::ApiError;
use crate::runner::ObjectTransfer;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;

/// Bucket keys: 3-128 characters from `-_.a-z0-9`.
static BUCKET_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-_.a-z0-9]{3,128}$").unwrap());

const REGIONS: &[&str] = &["US", "EMEA", "AUS", "CAN", "DEU", "IND", "JPN", "GBN"];

/// URN the Design Automation engine uses to address an OSS object.
pub fn object_urn(bucket_key: &str, object_key: &str) -> String {
    format!("urn:adsk.objects:os.object:{bucket_key}/{object_key}")
}

pub fn validate_bucket_key(bucket_key: &str) -> Result<(), ApiError> {
    if BUCKET_KEY.is_match(bucket_key) {
        Ok(())
    } else {
        Err(ApiError::Invalid(format!(
            "invalid bucket key '{bucket_key}': use 3-128 characters from -_.a-z0-9"
        )))
    }
}

/// Bucket retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKey {
    Transient,
    Temporary,
    Persistent,
}

impl PolicyKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKey::Transient => "transient",
            PolicyKey::Temporary => "temporary",
            PolicyKey::Persistent => "persistent",
        }
    }
}

impl std::str::FromStr for PolicyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(PolicyKey::Transient),
            "temporary" => Ok(PolicyKey::Temporary),
            "persistent" => Ok(PolicyKey::Persistent),
            other => Err(format!(
                "unknown policy key '{other}' (expected transient, temporary or persistent)"
            )),
        }
    }
}

/// Create a bucket in `region`.
pub async fn create_bucket(
    client: &ApsClient,
    bucket_key: &str,
    policy: PolicyKey,
    region: &str,
) -> Result<Value, ApiError> {
    validate_bucket_key(bucket_key)?;
    if !REGIONS.contains(&region) {
        return Err(ApiError::Invalid(format!(
            "unknown storage region '{region}' (expected one of {})",
            REGIONS.join(", ")
        )));
    }

    let req = client
        .authorized(Method::POST, client.endpoints().oss(&["buckets"]))
        .await?
        .header("x-ads-region", region)
        .json(&json!({
            "bucketKey": bucket_key,
            "access": "full",
            "policyKey": policy.as_str(),
        }));
    let created = client.send_json(req).await?;
    tracing::info!(bucket = bucket_key, policy = policy.as_str(), region, "bucket created");
    Ok(created)
}

/// Create the bucket unless it already exists.
pub async fn ensure_bucket(
    client: &ApsClient,
    bucket_key: &str,
    policy: PolicyKey,
    region: &str,
) -> Result<(), ApiError> {
    match create_bucket(client, bucket_key, policy, region).await {
        Ok(_) => Ok(()),
        Err(e) if e.status() == Some(409) => {
            tracing::debug!(bucket = bucket_key, "bucket already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUpload {
    pub upload_key: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignedDownload {
    pub url: String,
}

fn signed_url(client: &ApsClient, object: &ObjectLocation, action: &str) -> Url {
    client.endpoints().oss(&[
        "buckets",
        &object.bucket_key,
        "objects",
        &object.object_key,
        action,
    ])
}

fn parse_url(raw: &str) -> Result<Url, ApiError> {
    Url::parse(raw).map_err(|e| ApiError::Invalid(format!("service returned an invalid url: {e}")))
}

pub async fn signed_upload(
    client: &ApsClient,
    object: &ObjectLocation,
) -> Result<SignedUpload, ApiError> {
    let req = client
        .authorized(Method::GET, signed_url(client, object, "signeds3upload"))
        .await?;
    client.send_json(req).await
}

pub async fn complete_signed_upload(
    client: &ApsClient,
    object: &ObjectLocation,
    upload_key: &str,
) -> Result<Value, ApiError> {
    let req = client
        .authorized(Method::POST, signed_url(client, object, "signeds3upload"))
        .await?
        .json(&json!({ "uploadKey": upload_key }));
    client.send_json(req).await
}

/// PUT raw bytes to a pre-signed S3 URL.
pub async fn put_to_signed_url(client: &ApsClient, url: &str, bytes: Vec<u8>) -> Result<u16, ApiError> {
    let req = client
        .unauthorized(Method::PUT, parse_url(url)?)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(bytes);
    let response = client.send(req).await?;
    Ok(response.status().as_u16())
}

/// Upload a local file to an OSS object. Returns the bytes sent.
pub async fn upload_file(
    client: &ApsClient,
    object: &ObjectLocation,
    source: &Path,
) -> Result<u64, ApiError> {
    let bytes = tokio::fs::read(source).await.map_err(|e| ApiError::Io {
        path: source.to_path_buf(),
        source: e,
    })?;
    let len = bytes.len() as u64;

    let signed = signed_upload(client, object).await?;
    let url = signed
        .urls
        .first()
        .ok_or_else(|| ApiError::Invalid("signed upload returned no urls".to_string()))?;
    put_to_signed_url(client, url, bytes).await?;
    complete_signed_upload(client, object, &signed.upload_key).await?;

    tracing::info!(
        bucket = %object.bucket_key,
        object = %object.object_key,
        bytes = len,
        "uploaded object"
    );
    Ok(len)
}

pub async fn signed_download(
    client: &ApsClient,
    object: &ObjectLocation,
) -> Result<SignedDownload, ApiError> {
    let req = client
        .authorized(Method::GET, signed_url(client, object, "signeds3download"))
        .await?;
    client.send_json(req).await
}

/// Stream a signed URL into `dest`, creating parent directories.
pub async fn download_from_signed_url(
    client: &ApsClient,
    url: &str,
    dest: &Path,
) -> Result<u64, ApiError> {
    let io_err = |e: std::io::Error| ApiError::Io {
        path: dest.to_path_buf(),
        source: e,
    };

    let mut response = client.send(client.unauthorized(Method::GET, parse_url(url)?)).await?;
    let source_url = crate::client::redact(response.url());

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;

    let streamed = async {
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| ApiError::Transport {
            url: source_url.clone(),
            source: e,
        })? {
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        Ok(written)
    }
    .await;

    if streamed.is_err() {
        drop(file);
        // A truncated download must not pass for a finished one.
        if let Err(e) = tokio::fs::remove_file(dest).await {
            tracing::warn!(path = %dest.display(), error = %e, "failed to remove partial download");
        }
    }
    streamed
}

/// Download an OSS object to a local file. Returns the bytes written.
pub async fn download_file(
    client: &ApsClient,
    object: &ObjectLocation,
    dest: &Path,
) -> Result<u64, ApiError> {
    let signed = signed_download(client, object).await?;
    let written = download_from_signed_url(client, &signed.url, dest).await?;
    tracing::info!(
        bucket = %object.bucket_key,
        object = %object.object_key,
        path = %dest.display(),
        bytes = written,
        "downloaded object"
    );
    Ok(written)
}

/// [`ObjectTransfer`] backed by OSS signed S3 URLs.
///
/// Uploads create the target bucket on first use with the configured
/// policy and region.
#[derive(Debug, Clone)]
pub struct OssTransfer {
    client: ApsClient,
    policy: PolicyKey,
    region: String,
}

impl OssTransfer {
    pub fn new(client: ApsClient, policy: PolicyKey, region: impl Into<String>) -> Self {
        Self {
            client,
            policy,
            region: region.into(),
        }
    }
}

impl ObjectTransfer for OssTransfer {
    async fn upload(&self, object: &ObjectLocation, source: &Path) -> Result<u64, ApiError> {
        ensure_bucket(&self.client, &object.bucket_key, self.policy, &self.region).await?;
        upload_file(&self.client, object, source).await
    }

    async fn download(&self, object: &ObjectLocation, dest: &Path) -> Result<u64, ApiError> {
        download_file(&self.client, object, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{client_for, spawn};
    use axum::body::Bytes;
    use axum::extract::Path as AxumPath;
    use axum::http::{header::HOST, HeaderMap, StatusCode};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_object_urn() {
        assert_eq!(
            object_urn("my-bucket", "model.rvt"),
            "urn:adsk.objects:os.object:my-bucket/model.rvt"
        );
    }

    #[test]
    fn test_bucket_key_validation() {
        assert!(validate_bucket_key("my-bucket_01.a").is_ok());
        assert!(validate_bucket_key("ab").is_err());
        assert!(validate_bucket_key("UpperCase").is_err());
        assert!(validate_bucket_key("has space").is_err());
        assert!(validate_bucket_key(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_policy_key_parse() {
        assert_eq!("persistent".parse::<PolicyKey>().unwrap(), PolicyKey::Persistent);
        assert!("forever".parse::<PolicyKey>().is_err());
    }

    fn host(headers: &HeaderMap) -> String {
        headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    /// Fake OSS + S3: one bucket that already exists, one object slot.
    fn fake_oss(stored: Arc<Mutex<Vec<u8>>>, completed: Arc<Mutex<Option<String>>>) -> Router {
        let put_store = Arc::clone(&stored);
        let get_store = Arc::clone(&stored);
        Router::new()
            .route(
                "/oss/v2/buckets",
                post(|| async { (StatusCode::CONFLICT, "bucket exists") }),
            )
            .route(
                "/oss/v2/buckets/{bucket}/objects/{object}/signeds3upload",
                get(|headers: HeaderMap| async move {
                    Json(json!({
                        "uploadKey": "upload-key-1",
                        "urls": [format!("http://{}/s3/put?X-Amz-Signature=abc", host(&headers))],
                    }))
                })
                .post(move |AxumPath((bucket, object)): AxumPath<(String, String)>, Json(body): Json<Value>| {
                    let completed = Arc::clone(&completed);
                    async move {
                        *completed.lock().unwrap() = body["uploadKey"].as_str().map(String::from);
                        Json(json!({ "bucketKey": bucket, "objectKey": object }))
                    }
                }),
            )
            .route(
                "/oss/v2/buckets/{bucket}/objects/{object}/signeds3download",
                get(|headers: HeaderMap| async move {
                    Json(json!({ "url": format!("http://{}/s3/get", host(&headers)), "size": 5 }))
                }),
            )
            .route(
                "/s3/put",
                put(move |body: Bytes| {
                    let store = Arc::clone(&put_store);
                    async move {
                        *store.lock().unwrap() = body.to_vec();
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/s3/get",
                get(move || {
                    let store = Arc::clone(&get_store);
                    async move { store.lock().unwrap().clone() }
                }),
            )
    }

    #[tokio::test]
    async fn test_transfer_round_trip_through_signed_urls() {
        let stored = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(Mutex::new(None));
        let base = spawn(fake_oss(Arc::clone(&stored), Arc::clone(&completed))).await;
        let transfer = OssTransfer::new(client_for(&base), PolicyKey::Transient, "US");

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("model.rvt");
        std::fs::write(&source, b"hello").unwrap();
        let object = ObjectLocation::new("my-bucket", "model.rvt");

        let sent = transfer.upload(&object, &source).await.unwrap();
        assert_eq!(sent, 5);
        assert_eq!(stored.lock().unwrap().as_slice(), b"hello");
        assert_eq!(completed.lock().unwrap().as_deref(), Some("upload-key-1"));

        let dest = dir.path().join("out/nested/result.rvt");
        let received = transfer.download(&object, &dest).await.unwrap();
        assert_eq!(received, 5);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_io_error() {
        let client = client_for("http://127.0.0.1:9");
        let object = ObjectLocation::new("my-bucket", "model.rvt");
        let err = upload_file(&client, &object, Path::new("/nonexistent/model.rvt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Io { .. }));
    }

    #[tokio::test]
    async fn test_interrupted_download_leaves_no_file() {
        use tokio::io::AsyncReadExt;

        // Promises 100 bytes, sends 7, then hangs up.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });
        let base = format!("http://{addr}");
        let client = client_for(&base);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out").join("result.json");

        let err = download_from_signed_url(&client, &format!("{base}/s3/get"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Transport { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_create_bucket_rejects_bad_region() {
        let client = client_for("http://127.0.0.1:9");
        let err = create_bucket(&client, "my-bucket", PolicyKey::Transient, "MARS")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MARS"));
    }
}
