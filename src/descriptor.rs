//! Work item parameters and the validated job descriptor submitted to
//! Design Automation.
//!
//! A [`ParameterSpec`] names every option a parameter may carry; unknown
//! keys in job files are rejected rather than passed through. A
//! [`JobDescriptor`] can only be built from parameters that satisfy the
//! transfer contract: inbound parameters have a source, outbound parameters
//! have a writable destination.

use crate::auth::BearerToken;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// HTTP verb the engine uses to move a parameter's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Put,
    Post,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Put => "put",
            Verb::Post => "post",
        }
    }
}

/// Whether the engine reads the parameter or writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn default_verb(&self) -> Verb {
        match self {
            Direction::Inbound => Verb::Get,
            Direction::Outbound => Verb::Put,
        }
    }
}

/// An object in an OSS bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectLocation {
    pub bucket_key: String,
    pub object_key: String,
}

impl ObjectLocation {
    pub fn new(bucket_key: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket_key: bucket_key.into(),
            object_key: object_key.into(),
        }
    }

    /// `urn:adsk.objects:os.object:{bucket}/{object}`
    pub fn urn(&self) -> String {
        crate::oss::object_urn(&self.bucket_key, &self.object_key)
    }

    fn is_complete(&self) -> bool {
        !self.bucket_key.trim().is_empty() && !self.object_key.trim().is_empty()
    }
}

/// Where a parameter's bytes come from or go to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// An OSS object; the engine is given the object URN plus our bearer token.
    Oss(ObjectLocation),
    /// A pre-resolved storage URN (e.g. an ACC storage object).
    Urn(String),
    /// A signed or public URL; sent without credentials.
    Url(String),
    /// JSON passed inline as a data URL. Inbound only.
    InlineJson(Value),
}

impl Location {
    fn is_resolvable(&self) -> bool {
        match self {
            Location::Oss(obj) => obj.is_complete(),
            Location::Urn(s) | Location::Url(s) => !s.trim().is_empty(),
            Location::InlineJson(_) => true,
        }
    }
}

/// A single activity/work item parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSpec {
    pub name: String,
    pub direction: Direction,
    /// Name the engine sees on disk; defaults to `name`.
    #[serde(default)]
    pub local_name: Option<String>,
    /// Defaults to `get` for inbound and `put` for outbound.
    #[serde(default)]
    pub verb: Option<Verb>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub zip: bool,
    #[serde(default)]
    pub ondemand: bool,
    /// Marks the model file passed to the engine's `/i` switch.
    #[serde(default)]
    pub engine_input: bool,
    #[serde(default)]
    pub location: Option<Location>,
    /// Local file uploaded before submission (inbound) or downloaded after
    /// success (outbound). Requires an `Oss` location.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl ParameterSpec {
    fn with_direction(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            local_name: None,
            verb: None,
            description: String::new(),
            required: false,
            zip: false,
            ondemand: false,
            engine_input: false,
            location: None,
            file: None,
        }
    }

    pub fn inbound(name: impl Into<String>) -> Self {
        Self::with_direction(name, Direction::Inbound)
    }

    pub fn outbound(name: impl Into<String>) -> Self {
        Self::with_direction(name, Direction::Outbound)
    }

    pub fn local_name(mut self, local_name: impl Into<String>) -> Self {
        self.local_name = Some(local_name.into());
        self
    }

    pub fn verb(mut self, verb: Verb) -> Self {
        self.verb = Some(verb);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn zipped(mut self) -> Self {
        self.zip = true;
        self
    }

    pub fn engine_input(mut self) -> Self {
        self.engine_input = true;
        self
    }

    pub fn location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn oss(self, bucket_key: impl Into<String>, object_key: impl Into<String>) -> Self {
        self.location(Location::Oss(ObjectLocation::new(bucket_key, object_key)))
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn resolved_local_name(&self) -> &str {
        self.local_name.as_deref().unwrap_or(&self.name)
    }

    pub fn resolved_verb(&self) -> Verb {
        self.verb.unwrap_or_else(|| self.direction.default_verb())
    }

    /// The OSS object behind this parameter, if any.
    pub fn object(&self) -> Option<&ObjectLocation> {
        match &self.location {
            Some(Location::Oss(obj)) => Some(obj),
            _ => None,
        }
    }

    /// Entry for an activity's `parameters` map.
    pub fn activity_contract(&self) -> Value {
        json!({
            "localName": self.resolved_local_name(),
            "zip": self.zip,
            "ondemand": self.ondemand,
            "verb": self.resolved_verb().as_str(),
            "description": self.description,
            "required": self.required,
        })
    }

    /// Entry for a work item's `arguments` map.
    fn work_item_argument(&self, location: &Location, token: &BearerToken) -> Value {
        let verb = self.resolved_verb().as_str();
        match location {
            Location::Oss(obj) => json!({
                "url": obj.urn(),
                "verb": verb,
                "headers": { "Authorization": token.header_value() },
            }),
            Location::Urn(urn) => json!({
                "url": urn,
                "verb": verb,
                "headers": { "Authorization": token.header_value() },
            }),
            Location::Url(url) => json!({ "url": url, "verb": verb }),
            Location::InlineJson(content) => json!({ "url": inline_json_url(content) }),
        }
    }

    fn validate(&self) -> Result<&Location, DescriptorError> {
        if self.name.trim().is_empty() {
            return Err(DescriptorError::EmptyParameterName);
        }
        let verb = self.resolved_verb();
        let location = self.location.as_ref().filter(|l| l.is_resolvable());

        match self.direction {
            Direction::Inbound => {
                let location = location.ok_or_else(|| DescriptorError::MissingSource {
                    name: self.name.clone(),
                })?;
                if verb != Verb::Get {
                    return Err(DescriptorError::VerbMismatch {
                        name: self.name.clone(),
                        verb,
                        direction: self.direction,
                    });
                }
                if self.file.is_some() && self.object().is_none() {
                    return Err(DescriptorError::FileWithoutObject {
                        name: self.name.clone(),
                    });
                }
                Ok(location)
            }
            Direction::Outbound => {
                let location = location.ok_or_else(|| DescriptorError::MissingDestination {
                    name: self.name.clone(),
                })?;
                if matches!(location, Location::InlineJson(_)) {
                    return Err(DescriptorError::InlineOutput {
                        name: self.name.clone(),
                    });
                }
                if verb == Verb::Get {
                    return Err(DescriptorError::VerbMismatch {
                        name: self.name.clone(),
                        verb,
                        direction: self.direction,
                    });
                }
                if self.file.is_some() && self.object().is_none() {
                    return Err(DescriptorError::FileWithoutObject {
                        name: self.name.clone(),
                    });
                }
                Ok(location)
            }
        }
    }
}

/// `data:application/json,{compact json}`
pub fn inline_json_url(content: &Value) -> String {
    format!("data:application/json,{content}")
}

/// Reasons a descriptor cannot be built.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorError {
    EmptyActivity,
    EmptyParameterName,
    DuplicateParameter(String),
    MissingSource { name: String },
    MissingDestination { name: String },
    InlineOutput { name: String },
    VerbMismatch {
        name: String,
        verb: Verb,
        direction: Direction,
    },
    FileWithoutObject { name: String },
}

impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorError::EmptyActivity => write!(f, "activity id must not be empty"),
            DescriptorError::EmptyParameterName => write!(f, "parameter name must not be empty"),
            DescriptorError::DuplicateParameter(name) => {
                write!(f, "parameter '{name}' is declared more than once")
            }
            DescriptorError::MissingSource { name } => {
                write!(f, "inbound parameter '{name}' has no source location")
            }
            DescriptorError::MissingDestination { name } => {
                write!(f, "outbound parameter '{name}' has no destination location")
            }
            DescriptorError::InlineOutput { name } => {
                write!(f, "outbound parameter '{name}' cannot use inline JSON")
            }
            DescriptorError::VerbMismatch {
                name,
                verb,
                direction,
            } => write!(
                f,
                "parameter '{name}' uses verb '{}' which is invalid for {direction:?} transfers",
                verb.as_str()
            ),
            DescriptorError::FileWithoutObject { name } => {
                write!(f, "parameter '{name}' names a local file but has no OSS location")
            }
        }
    }
}

impl std::error::Error for DescriptorError {}

/// A validated, immutable description of one work item.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    activity_id: String,
    parameters: Vec<ParameterSpec>,
    signature: Option<String>,
}

impl JobDescriptor {
    /// Validate `parameters` against the transfer contract.
    pub fn new(
        activity_id: impl Into<String>,
        parameters: Vec<ParameterSpec>,
    ) -> Result<Self, DescriptorError> {
        Self::with_signature(activity_id, parameters, None)
    }

    /// Like [`JobDescriptor::new`], for public activities that require a
    /// work item signature.
    pub fn with_signature(
        activity_id: impl Into<String>,
        parameters: Vec<ParameterSpec>,
        signature: Option<String>,
    ) -> Result<Self, DescriptorError> {
        let activity_id = activity_id.into();
        if activity_id.trim().is_empty() {
            return Err(DescriptorError::EmptyActivity);
        }

        let mut seen = HashSet::new();
        for param in &parameters {
            param.validate()?;
            if !seen.insert(param.name.as_str()) {
                return Err(DescriptorError::DuplicateParameter(param.name.clone()));
            }
        }

        Ok(Self {
            activity_id,
            parameters,
            signature: signature.filter(|s| !s.trim().is_empty()),
        })
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Inbound parameters that carry a local file to upload.
    pub fn uploads(&self) -> impl Iterator<Item = (&ParameterSpec, &ObjectLocation, &Path)> {
        self.transfers(Direction::Inbound)
    }

    /// Outbound parameters that carry a local file to download into.
    pub fn downloads(&self) -> impl Iterator<Item = (&ParameterSpec, &ObjectLocation, &Path)> {
        self.transfers(Direction::Outbound)
    }

    fn transfers(
        &self,
        direction: Direction,
    ) -> impl Iterator<Item = (&ParameterSpec, &ObjectLocation, &Path)> {
        self.parameters
            .iter()
            .filter(move |p| p.direction == direction)
            .filter_map(|p| Some((p, p.object()?, p.file.as_deref()?)))
    }

    /// The `arguments` object of a work item request.
    pub fn arguments(&self, token: &BearerToken) -> Map<String, Value> {
        self.parameters
            .iter()
            .filter_map(|p| {
                let location = p.location.as_ref()?;
                Some((p.name.clone(), p.work_item_argument(location, token)))
            })
            .collect()
    }

    /// Full `POST /workitems` body.
    pub fn work_item_payload(&self, token: &BearerToken) -> Value {
        let mut payload = json!({
            "activityId": self.activity_id,
            "arguments": self.arguments(token),
        });
        if let Some(signature) = &self.signature {
            payload["signatures"] = json!({
                "activityId": signature,
                "workItem": signature,
            });
        }
        payload
    }
}

/// Work item definition as written in a TOML job file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    pub activity: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default, rename = "parameter")]
    pub parameters: Vec<ParameterSpec>,
}

/// Errors loading a job file.
#[derive(Debug)]
pub enum JobFileError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        path: PathBuf,
        source: DescriptorError,
    },
}

impl std::fmt::Display for JobFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFileError::Read { path, source } => {
                write!(f, "failed to read job file {}: {}", path.display(), source)
            }
            JobFileError::Parse { path, source } => {
                write!(f, "failed to parse job file {}: {}", path.display(), source)
            }
            JobFileError::Invalid { path, source } => {
                write!(f, "invalid job file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for JobFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobFileError::Read { source, .. } => Some(source),
            JobFileError::Parse { source, .. } => Some(source),
            JobFileError::Invalid { source, .. } => Some(source),
        }
    }
}

/// Parse and validate a job file. Relative `file` paths resolve against
/// the job file's directory.
pub fn load_job_file(path: &Path) -> Result<JobDescriptor, JobFileError> {
    let contents = std::fs::read_to_string(path).map_err(|e| JobFileError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let job: JobFile = toml::from_str(&contents).map_err(|e| JobFileError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    let base = path.parent().unwrap_or(Path::new("."));
    let parameters = job
        .parameters
        .into_iter()
        .map(|mut p| {
            if let Some(file) = p.file.take() {
                p.file = Some(if file.is_relative() { base.join(file) } else { file });
            }
            p
        })
        .collect();

    JobDescriptor::with_signature(job.activity, parameters, job.signature).map_err(|e| {
        JobFileError::Invalid {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn token() -> BearerToken {
        BearerToken::new("tok")
    }

    fn model_input() -> ParameterSpec {
        ParameterSpec::inbound("inputFile")
            .local_name("input.rvt")
            .oss("my-bucket", "model.rvt")
            .engine_input()
    }

    fn result_output() -> ParameterSpec {
        ParameterSpec::outbound("result").oss("my-bucket", "result.rvt")
    }

    #[test]
    fn test_valid_descriptor() {
        let desc = JobDescriptor::new("nick.Update+prod", vec![model_input(), result_output()])
            .unwrap();
        assert_eq!(desc.activity_id(), "nick.Update+prod");
        assert_eq!(desc.parameters().len(), 2);
        assert!(desc.signature().is_none());
    }

    #[test]
    fn test_empty_activity_rejected() {
        let err = JobDescriptor::new("  ", vec![]).unwrap_err();
        assert_eq!(err, DescriptorError::EmptyActivity);
    }

    #[test]
    fn test_inbound_without_source_rejected() {
        let err = JobDescriptor::new("a.b+c", vec![ParameterSpec::inbound("inputFile")])
            .unwrap_err();
        assert_eq!(
            err,
            DescriptorError::MissingSource {
                name: "inputFile".into()
            }
        );
    }

    #[test]
    fn test_inbound_with_blank_object_key_rejected() {
        let param = ParameterSpec::inbound("inputFile").oss("bucket", " ");
        let err = JobDescriptor::new("a.b+c", vec![param]).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingSource { .. }));
    }

    #[test]
    fn test_outbound_without_destination_rejected() {
        let err = JobDescriptor::new("a.b+c", vec![ParameterSpec::outbound("result")])
            .unwrap_err();
        assert!(matches!(err, DescriptorError::MissingDestination { .. }));
    }

    #[test]
    fn test_outbound_inline_json_rejected() {
        let param = ParameterSpec::outbound("result").location(Location::InlineJson(json!({})));
        let err = JobDescriptor::new("a.b+c", vec![param]).unwrap_err();
        assert!(matches!(err, DescriptorError::InlineOutput { .. }));
    }

    #[test]
    fn test_outbound_get_verb_rejected() {
        let param = result_output().verb(Verb::Get);
        let err = JobDescriptor::new("a.b+c", vec![param]).unwrap_err();
        assert!(matches!(err, DescriptorError::VerbMismatch { .. }));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = JobDescriptor::new("a.b+c", vec![model_input(), model_input()]).unwrap_err();
        assert_eq!(err, DescriptorError::DuplicateParameter("inputFile".into()));
    }

    #[test]
    fn test_local_file_requires_oss_location() {
        let param = ParameterSpec::inbound("inputFile")
            .location(Location::Url("https://signed.example/x".into()))
            .file("model.rvt");
        let err = JobDescriptor::new("a.b+c", vec![param]).unwrap_err();
        assert!(matches!(err, DescriptorError::FileWithoutObject { .. }));
    }

    #[test]
    fn test_default_verbs_follow_direction() {
        assert_eq!(model_input().resolved_verb(), Verb::Get);
        assert_eq!(result_output().resolved_verb(), Verb::Put);
        assert_eq!(result_output().verb(Verb::Post).resolved_verb(), Verb::Post);
    }

    #[test]
    fn test_oss_argument_carries_urn_and_bearer() {
        let desc = JobDescriptor::new("a.b+c", vec![model_input()]).unwrap();
        let args = desc.arguments(&token());
        let arg = &args["inputFile"];
        assert_eq!(arg["url"], "urn:adsk.objects:os.object:my-bucket/model.rvt");
        assert_eq!(arg["verb"], "get");
        assert_eq!(arg["headers"]["Authorization"], "Bearer tok");
    }

    #[test]
    fn test_url_argument_has_no_credentials() {
        let param = ParameterSpec::outbound("result")
            .location(Location::Url("https://signed.example/put".into()));
        let desc = JobDescriptor::new("a.b+c", vec![param]).unwrap();
        let args = desc.arguments(&token());
        assert_eq!(args["result"]["url"], "https://signed.example/put");
        assert_eq!(args["result"]["verb"], "put");
        assert!(args["result"].get("headers").is_none());
    }

    #[test]
    fn test_inline_json_argument() {
        let param = ParameterSpec::inbound("params")
            .location(Location::InlineJson(json!({"height": 3.5, "name": "wall"})));
        let desc = JobDescriptor::new("a.b+c", vec![param]).unwrap();
        let args = desc.arguments(&token());
        let url = args["params"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:application/json,{"));
        assert!(url.contains(r#""height":3.5"#));
        assert!(!url.contains(' '));
    }

    #[test]
    fn test_payload_includes_signatures_when_present() {
        let desc = JobDescriptor::with_signature(
            "a.b+c",
            vec![model_input()],
            Some("sig==".to_string()),
        )
        .unwrap();
        let payload = desc.work_item_payload(&token());
        assert_eq!(payload["activityId"], "a.b+c");
        assert_eq!(payload["signatures"]["workItem"], "sig==");
        assert_eq!(payload["signatures"]["activityId"], "sig==");
    }

    #[test]
    fn test_payload_omits_signatures_by_default() {
        let desc = JobDescriptor::new("a.b+c", vec![model_input()]).unwrap();
        let payload = desc.work_item_payload(&token());
        assert!(payload.get("signatures").is_none());
    }

    #[test]
    fn test_activity_contract_fields() {
        let contract = model_input().description("Input model").required().activity_contract();
        assert_eq!(contract["localName"], "input.rvt");
        assert_eq!(contract["verb"], "get");
        assert_eq!(contract["required"], true);
        assert_eq!(contract["zip"], false);
        assert_eq!(contract["description"], "Input model");
    }

    #[test]
    fn test_uploads_and_downloads() {
        let desc = JobDescriptor::new(
            "a.b+c",
            vec![
                model_input().file("/tmp/model.rvt"),
                result_output().file("/tmp/out.rvt"),
                ParameterSpec::inbound("params").location(Location::InlineJson(json!({}))),
            ],
        )
        .unwrap();

        let uploads: Vec<_> = desc.uploads().map(|(p, _, f)| (p.name.clone(), f.to_path_buf())).collect();
        assert_eq!(uploads, vec![("inputFile".to_string(), PathBuf::from("/tmp/model.rvt"))]);

        let downloads: Vec<_> = desc.downloads().map(|(p, o, _)| (p.name.clone(), o.object_key.clone())).collect();
        assert_eq!(downloads, vec![("result".to_string(), "result.rvt".to_string())]);
    }

    #[test]
    fn test_load_job_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            r#"
activity = "nick.CountWalls+prod"

[[parameter]]
name = "inputFile"
direction = "inbound"
file = "model.rvt"
location = { oss = { bucket_key = "bkt", object_key = "model.rvt" } }

[[parameter]]
name = "params"
direction = "inbound"
location = { inline_json = { walls = true } }

[[parameter]]
name = "result"
direction = "outbound"
file = "/abs/result.json"
location = { oss = { bucket_key = "bkt", object_key = "result.json" } }
"#,
        )
        .unwrap();

        let desc = load_job_file(&path).unwrap();
        assert_eq!(desc.activity_id(), "nick.CountWalls+prod");
        assert_eq!(desc.parameters().len(), 3);
        assert_eq!(desc.parameters()[0].file.as_deref(), Some(dir.path().join("model.rvt").as_path()));
        assert_eq!(desc.parameters()[2].file.as_deref(), Some(Path::new("/abs/result.json")));
        assert_eq!(
            desc.parameters()[1].location,
            Some(Location::InlineJson(json!({"walls": true})))
        );
    }

    #[test]
    fn test_demo_job_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/job.toml");
        let desc = load_job_file(&path).unwrap();
        assert_eq!(desc.uploads().count(), 1);
        assert_eq!(desc.downloads().count(), 1);
    }

    #[test]
    fn test_job_file_unknown_key_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            "activity = \"a.b+c\"\n\n[[parameter]]\nname = \"x\"\ndirection = \"inbound\"\nbucketKey = \"oops\"\n",
        )
        .unwrap();
        let err = load_job_file(&path).unwrap_err();
        assert!(matches!(err, JobFileError::Parse { .. }));
    }

    #[test]
    fn test_job_file_contract_violation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            "activity = \"a.b+c\"\n\n[[parameter]]\nname = \"result\"\ndirection = \"outbound\"\n",
        )
        .unwrap();
        let err = load_job_file(&path).unwrap_err();
        assert!(matches!(err, JobFileError::Invalid { .. }));
        assert!(err.to_string().contains("no destination"));
    }
}
