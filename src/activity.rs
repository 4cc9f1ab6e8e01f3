//! Activities: the command line, engine and parameter contract a work item
//! runs against.

use crate::appbundle::{validate_alias, validate_id};
use crate::client::ApsClient;
use crate::descriptor::{Direction, ParameterSpec};
use crate::error::ApiError;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;

/// Activity definition, loadable from TOML with `[[parameter]]` tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivityDefinition {
    pub id: String,
    pub engine: String,
    /// Full app bundle alias, `owner.Name+alias`.
    pub appbundle: String,
    pub alias: String,
    #[serde(default)]
    pub description: String,
    /// Explicit command line. When absent a Revit core console command line
    /// is built from the engine-input parameter.
    #[serde(default)]
    pub command_line: Option<Vec<String>>,
    #[serde(default, rename = "parameter")]
    pub parameters: Vec<ParameterSpec>,
}

/// The `Name` part of `owner.Name+alias`.
pub fn short_appbundle_id(full_alias: &str) -> &str {
    let right = full_alias
        .split_once('.')
        .map_or(full_alias, |(_, rest)| rest);
    right.split_once('+').map_or(right, |(name, _)| name)
}

impl ActivityDefinition {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_id("activity", &self.id)?;
        validate_alias(&self.alias)?;
        if self.engine.trim().is_empty() {
            return Err(ApiError::Invalid(format!("activity '{}' has no engine", self.id)));
        }
        if short_appbundle_id(&self.appbundle).is_empty() {
            return Err(ApiError::Invalid(format!(
                "activity '{}' references no app bundle",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if param.name.trim().is_empty() {
                return Err(ApiError::Invalid(format!(
                    "activity '{}' has a parameter with an empty name",
                    self.id
                )));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(ApiError::Invalid(format!(
                    "activity '{}' declares parameter '{}' twice",
                    self.id, param.name
                )));
            }
        }
        Ok(())
    }

    /// `parameters` object of the activity payload.
    pub fn param_map(&self) -> Map<String, Value> {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.activity_contract()))
            .collect()
    }

    /// `revitcoreconsole.exe` invocation opening the engine-input parameter
    /// and loading this activity's app bundle.
    pub fn revit_command_line(&self) -> Result<Vec<String>, ApiError> {
        let input = self
            .parameters
            .iter()
            .find(|p| p.direction == Direction::Inbound && p.engine_input)
            .ok_or_else(|| {
                ApiError::Invalid(format!(
                    "activity '{}' has no inbound parameter marked engine_input",
                    self.id
                ))
            })?;
        Ok(vec![format!(
            "$(engine.path)\\revitcoreconsole.exe /i \"$(args[{}].path)\" /al \"$(appbundles[{}].path)\"",
            input.name,
            short_appbundle_id(&self.appbundle)
        )])
    }

    pub fn resolved_command_line(&self) -> Result<Vec<String>, ApiError> {
        match &self.command_line {
            Some(lines) if !lines.is_empty() => Ok(lines.clone()),
            _ => self.revit_command_line(),
        }
    }

    /// Body of `POST {da}/activities`.
    pub fn payload(&self) -> Result<Value, ApiError> {
        self.validate()?;
        Ok(json!({
            "id": self.id,
            "commandLine": self.resolved_command_line()?,
            "parameters": self.param_map(),
            "engine": self.engine,
            "appbundles": [self.appbundle],
            "description": self.description,
        }))
    }

    /// `{nickname}.{id}+{alias}`, the id work items are submitted against.
    pub fn full_alias(&self, nickname: &str) -> String {
        format!("{nickname}.{}+{}", self.id, self.alias)
    }
}

pub fn load_activity_file(path: &Path) -> Result<ActivityDefinition, ApiError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ApiError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let def: ActivityDefinition = toml::from_str(&contents)
        .map_err(|e| ApiError::Invalid(format!("failed to parse {}: {e}", path.display())))?;
    def.validate()?;
    Ok(def)
}

#[derive(Debug, Deserialize)]
struct CreatedActivity {
    #[serde(default)]
    version: Option<u32>,
}

/// `POST {da}/activities`. Returns the created version.
pub async fn create_activity(client: &ApsClient, def: &ActivityDefinition) -> Result<u32, ApiError> {
    let payload = def.payload()?;
    let req = client
        .authorized(Method::POST, client.endpoints().da(&["activities"]))
        .await?
        .json(&payload);
    let created: CreatedActivity = client.send_json(req).await?;
    Ok(created.version.unwrap_or(1))
}

/// `POST {da}/activities/{id}/aliases`
pub async fn create_activity_alias(
    client: &ApsClient,
    activity_id: &str,
    alias: &str,
    version: u32,
) -> Result<Value, ApiError> {
    validate_alias(alias)?;
    let req = client
        .authorized(
            Method::POST,
            client.endpoints().da(&["activities", activity_id, "aliases"]),
        )
        .await?
        .json(&json!({ "id": alias, "version": version }));
    client.send_json(req).await
}

/// Create the activity and alias its first version. Returns the version.
pub async fn deploy_activity(client: &ApsClient, def: &ActivityDefinition) -> Result<u32, ApiError> {
    let version = create_activity(client, def).await?;
    create_activity_alias(client, &def.id, &def.alias, version).await?;
    tracing::info!(activity = %def.id, version, alias = %def.alias, "activity deployed");
    Ok(version)
}

/// `DELETE {da}/activities/{id}`, removing every version and alias.
pub async fn delete_activity(client: &ApsClient, activity_id: &str) -> Result<(), ApiError> {
    validate_id("activity", activity_id)?;
    let req = client
        .authorized(Method::DELETE, client.endpoints().da(&["activities", activity_id]))
        .await?;
    client.send(req).await?;
    tracing::info!(activity = activity_id, "activity deleted");
    Ok(())
}
