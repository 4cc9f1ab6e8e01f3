//! Autodesk Construction Cloud helpers over the Data Management API:
//! resolve where a model lives and publish work item output next to it.

use crate::client::ApsClient;
use crate::descriptor::ObjectLocation;
use crate::error::ApiError;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};

const JSON_API: &str = "application/vnd.api+json";
const OBJECT_URN_PREFIX: &str = "urn:adsk.objects:os.object:";

#[derive(Debug, Deserialize)]
struct Document<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    attributes: Value,
}

impl Resource {
    fn into_id(self, kind: &str, context: &str) -> Result<String, ApiError> {
        if self.kind == kind && !self.id.is_empty() {
            Ok(self.id)
        } else {
            Err(ApiError::Invalid(format!(
                "unexpected {context} payload: got '{}' resource, expected '{kind}'",
                self.kind
            )))
        }
    }
}

/// Split a storage URN (`urn:adsk.objects:os.object:{bucket}/{object}`)
/// into its OSS location.
pub fn storage_object(storage_urn: &str) -> Option<ObjectLocation> {
    let rest = storage_urn.strip_prefix(OBJECT_URN_PREFIX)?;
    let (bucket, object) = rest.split_once('/')?;
    if bucket.is_empty() || object.is_empty() {
        return None;
    }
    Some(ObjectLocation::new(bucket, object))
}

fn json_api(builder: RequestBuilder, body: &Value) -> RequestBuilder {
    builder.header(CONTENT_TYPE, JSON_API).json(body)
}

/// Item lineage of a version. The URN must name a version (`?version=N`).
pub async fn item_from_version(
    client: &ApsClient,
    project_id: &str,
    version_urn: &str,
) -> Result<String, ApiError> {
    if !version_urn.contains("?version=") {
        return Err(ApiError::Invalid(format!(
            "version urn '{version_urn}' must include '?version=N'"
        )));
    }
    let url = client
        .endpoints()
        .data(&["projects", project_id, "versions", version_urn, "item"]);
    let req = client.authorized(Method::GET, url).await?;
    let doc: Document<Resource> = client.send_json(req).await?;
    doc.data.into_id("items", "version item")
}

pub async fn parent_folder(
    client: &ApsClient,
    project_id: &str,
    item_id: &str,
) -> Result<String, ApiError> {
    let url = client
        .endpoints()
        .data(&["projects", project_id, "items", item_id, "parent"]);
    let req = client.authorized(Method::GET, url).await?;
    let doc: Document<Resource> = client.send_json(req).await?;
    doc.data.into_id("folders", "item parent")
}

/// Folder containing the item a version belongs to.
pub async fn resolve_parent_folder(
    client: &ApsClient,
    project_id: &str,
    version_urn: &str,
) -> Result<String, ApiError> {
    let item_id = item_from_version(client, project_id, version_urn).await?;
    parent_folder(client, project_id, &item_id).await
}

/// Raw `tip` document of an item.
pub async fn tip_version(
    client: &ApsClient,
    project_id: &str,
    item_id: &str,
) -> Result<Value, ApiError> {
    let url = client
        .endpoints()
        .data(&["projects", project_id, "items", item_id, "tip"]);
    let req = client.authorized(Method::GET, url).await?;
    client.send_json(req).await
}

/// First storage id found on the tip version or its included resources.
pub fn tip_storage_id(tip: &Value) -> Option<String> {
    let data = std::iter::once(&tip["data"]);
    let included = tip["included"].as_array().into_iter().flatten();
    data.chain(included)
        .filter_map(|node| node["relationships"]["storage"]["data"]["id"].as_str())
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

/// Reserve a storage object in `folder_id` for a file named `file_name`.
/// Returns the storage URN.
pub async fn create_storage(
    client: &ApsClient,
    project_id: &str,
    folder_id: &str,
    file_name: &str,
) -> Result<String, ApiError> {
    let body = json!({
        "jsonapi": { "version": "1.0" },
        "data": {
            "type": "objects",
            "attributes": { "name": file_name },
            "relationships": {
                "target": { "data": { "type": "folders", "id": folder_id } }
            }
        }
    });
    let url = client.endpoints().data(&["projects", project_id, "storage"]);
    let req = json_api(client.authorized(Method::POST, url).await?, &body);
    let doc: Document<Resource> = client.send_json(req).await?;
    let storage = doc.data.into_id("objects", "storage")?;
    tracing::debug!(project = project_id, folder = folder_id, storage = %storage, "storage created");
    Ok(storage)
}

/// Id of the item in `folder_id` whose display name is `file_name`.
pub async fn find_item_by_name(
    client: &ApsClient,
    project_id: &str,
    folder_id: &str,
    file_name: &str,
) -> Result<Option<String>, ApiError> {
    let url = client
        .endpoints()
        .data(&["projects", project_id, "folders", folder_id, "contents"]);
    let req = client.authorized(Method::GET, url).await?;
    let doc: Document<Vec<Resource>> = client.send_json(req).await?;
    Ok(doc
        .data
        .into_iter()
        .find(|r| r.kind == "items" && r.attributes["displayName"] == file_name)
        .map(|r| r.id))
}

/// Add a version to an existing item, pointing at `storage_id`.
pub async fn create_version(
    client: &ApsClient,
    project_id: &str,
    item_id: &str,
    file_name: &str,
    storage_id: &str,
) -> Result<Value, ApiError> {
    let body = json!({
        "jsonapi": { "version": "1.0" },
        "data": {
            "type": "versions",
            "attributes": {
                "name": file_name,
                "extension": { "type": "versions:autodesk.bim360:File", "version": "1.0" }
            },
            "relationships": {
                "item": { "data": { "type": "items", "id": item_id } },
                "storage": { "data": { "type": "objects", "id": storage_id } }
            }
        }
    });
    let url = client.endpoints().data(&["projects", project_id, "versions"]);
    let req = json_api(client.authorized(Method::POST, url).await?, &body);
    client.send_json(req).await
}

/// Create a new item in `folder_id` whose first version points at
/// `storage_id`.
pub async fn create_item(
    client: &ApsClient,
    project_id: &str,
    folder_id: &str,
    file_name: &str,
    storage_id: &str,
) -> Result<Value, ApiError> {
    let body = json!({
        "jsonapi": { "version": "1.0" },
        "data": {
            "type": "items",
            "attributes": {
                "displayName": file_name,
                "extension": { "type": "items:autodesk.bim360:File", "version": "1.0" }
            },
            "relationships": {
                "tip": { "data": { "type": "versions", "id": "1" } },
                "parent": { "data": { "type": "folders", "id": folder_id } }
            }
        },
        "included": [{
            "type": "versions",
            "id": "1",
            "attributes": {
                "name": file_name,
                "extension": { "type": "versions:autodesk.bim360:File", "version": "1.0" }
            },
            "relationships": {
                "storage": { "data": { "type": "objects", "id": storage_id } }
            }
        }]
    });
    let url = client.endpoints().data(&["projects", project_id, "items"]);
    let req = json_api(client.authorized(Method::POST, url).await?, &body);
    client.send_json(req).await
}

/// How [`publish_output`] registered the file.
#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    NewVersion { item_id: String, response: Value },
    NewItem { response: Value },
}

/// Register uploaded storage as `file_name` in `folder_id`: a new version
/// when an item of that name exists, otherwise a new item.
pub async fn publish_output(
    client: &ApsClient,
    project_id: &str,
    folder_id: &str,
    file_name: &str,
    storage_id: &str,
) -> Result<Published, ApiError> {
    match find_item_by_name(client, project_id, folder_id, file_name).await? {
        Some(item_id) => {
            let response = create_version(client, project_id, &item_id, file_name, storage_id).await?;
            tracing::info!(project = project_id, item = %item_id, file = file_name, "published new version");
            Ok(Published::NewVersion { item_id, response })
        }
        None => {
            let response = create_item(client, project_id, folder_id, file_name, storage_id).await?;
            tracing::info!(project = project_id, folder = folder_id, file = file_name, "published new item");
            Ok(Published::NewItem { response })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{client_for, spawn};
    use axum::extract::{Path as AxumPath, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    const VERSION_URN: &str = "urn:adsk.wipprod:fs.file:vf.abc?version=3";

    #[test]
    fn test_storage_object() {
        let obj = storage_object("urn:adsk.objects:os.object:wip.dm.prod/a1b2.rvt").unwrap();
        assert_eq!(obj.bucket_key, "wip.dm.prod");
        assert_eq!(obj.object_key, "a1b2.rvt");
        assert!(storage_object("urn:adsk.wipprod:fs.file:vf.abc").is_none());
        assert!(storage_object("urn:adsk.objects:os.object:bucket-only").is_none());
    }

    #[test]
    fn test_tip_storage_id_from_data_or_included() {
        let direct = json!({
            "data": { "relationships": { "storage": { "data": { "id": "urn:s1" } } } }
        });
        assert_eq!(tip_storage_id(&direct).as_deref(), Some("urn:s1"));

        let included = json!({
            "data": { "relationships": {} },
            "included": [
                { "relationships": { "storage": { "data": null } } },
                { "relationships": { "storage": { "data": { "id": "urn:s2" } } } }
            ]
        });
        assert_eq!(tip_storage_id(&included).as_deref(), Some("urn:s2"));
        assert_eq!(tip_storage_id(&json!({ "data": {} })), None);
    }

    #[tokio::test]
    async fn test_item_from_version_requires_version_query() {
        let client = client_for("http://127.0.0.1:9");
        let err = item_from_version(&client, "b.p", "urn:adsk.wipprod:fs.file:vf.abc")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_resolve_parent_folder() {
        let router = Router::new()
            .route(
                "/data/v1/projects/{project}/versions/{version}/item",
                get(|AxumPath((_p, version)): AxumPath<(String, String)>| async move {
                    assert_eq!(version, VERSION_URN);
                    Json(json!({ "data": { "type": "items", "id": "urn:item:1" } }))
                }),
            )
            .route(
                "/data/v1/projects/{project}/items/{item}/parent",
                get(|AxumPath((_p, item)): AxumPath<(String, String)>| async move {
                    assert_eq!(item, "urn:item:1");
                    Json(json!({ "data": { "type": "folders", "id": "urn:folder:9" } }))
                }),
            );
        let base = spawn(router).await;
        let client = client_for(&base);

        let folder = resolve_parent_folder(&client, "b.p", VERSION_URN).await.unwrap();
        assert_eq!(folder, "urn:folder:9");
    }

    #[tokio::test]
    async fn test_unexpected_resource_type_is_error() {
        let router = Router::new().route(
            "/data/v1/projects/{project}/items/{item}/parent",
            get(|| async { Json(json!({ "data": { "type": "items", "id": "x" } })) }),
        );
        let base = spawn(router).await;
        let client = client_for(&base);

        let err = parent_folder(&client, "b.p", "urn:item:1").await.unwrap_err();
        assert!(err.to_string().contains("expected 'folders'"));
    }

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    fn data_api(existing: Option<&'static str>) -> (Router, Calls) {
        let calls: Calls = Arc::default();
        let contents = move || async move {
            let mut data = vec![json!({
                "type": "folders", "id": "urn:sub", "attributes": { "displayName": "result.json" }
            })];
            if let Some(name) = existing {
                data.push(json!({
                    "type": "items", "id": "urn:item:existing", "attributes": { "displayName": name }
                }));
            }
            Json(json!({ "data": data }))
        };
        let record = |kind: &'static str| {
            move |State(calls): State<Calls>, headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers.get("content-type").unwrap(), JSON_API);
                calls.lock().unwrap().push((kind.to_string(), body));
                Json(json!({ "data": { "type": kind, "id": "new" } }))
            }
        };
        let router = Router::new()
            .route("/data/v1/projects/{project}/folders/{folder}/contents", get(contents))
            .route("/data/v1/projects/{project}/storage", post(record("objects")))
            .route("/data/v1/projects/{project}/versions", post(record("versions")))
            .route("/data/v1/projects/{project}/items", post(record("items")))
            .with_state(calls.clone());
        (router, calls)
    }

    #[tokio::test]
    async fn test_publish_output_adds_version_to_existing_item() {
        let (router, calls) = data_api(Some("result.json"));
        let base = spawn(router).await;
        let client = client_for(&base);

        let storage = create_storage(&client, "b.p", "urn:folder:9", "result.json").await.unwrap();
        assert_eq!(storage, "new");
        let published = publish_output(&client, "b.p", "urn:folder:9", "result.json", &storage)
            .await
            .unwrap();

        match published {
            Published::NewVersion { item_id, .. } => assert_eq!(item_id, "urn:item:existing"),
            other => panic!("expected new version, got {other:?}"),
        }
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1["data"]["relationships"]["target"]["data"]["id"], "urn:folder:9");
        assert_eq!(calls[1].0, "versions");
        assert_eq!(calls[1].1["data"]["relationships"]["item"]["data"]["id"], "urn:item:existing");
        assert_eq!(calls[1].1["data"]["relationships"]["storage"]["data"]["id"], "new");
    }

    #[tokio::test]
    async fn test_publish_output_creates_item_when_missing() {
        let (router, calls) = data_api(None);
        let base = spawn(router).await;
        let client = client_for(&base);

        let published = publish_output(&client, "b.p", "urn:folder:9", "result.json", "urn:storage:1")
            .await
            .unwrap();

        assert!(matches!(published, Published::NewItem { .. }));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "items");
        assert_eq!(calls[0].1["data"]["attributes"]["displayName"], "result.json");
        assert_eq!(
            calls[0].1["included"][0]["relationships"]["storage"]["data"]["id"],
            "urn:storage:1"
        );
    }
}
