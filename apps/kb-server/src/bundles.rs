use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::valid_id;
use crate::phases::sha256_hex;

/// A versioned policy bundle (`<bundles_dir>/<version>.toml`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct PolicyBundle {
    pub version: String,
    #[serde(default)]
    pub thresholds: BTreeMap<String, toml::Value>,
}

impl PolicyBundle {
    /// sha256 over the canonical (sorted-key, compact) JSON of `thresholds`.
    pub(crate) fn thresholds_hash(&self) -> Result<String, CatalogError> {
        let value = serde_json::to_value(&self.thresholds).map_err(|e| CatalogError::Invalid {
            what: "policy bundle",
            id: self.version.clone(),
            detail: e.to_string(),
        })?;
        let canonical = canonicalize(value);
        Ok(sha256_hex(canonical.to_string().as_bytes()))
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// An authorization model (`<access_models_dir>/<id>.json`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct AccessModel {
    pub id: String,
    pub schema_version: String,
    pub type_definitions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub(crate) enum CatalogError {
    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },
    #[error("{what} '{id}' is invalid: {detail}")]
    Invalid {
        what: &'static str,
        id: String,
        detail: String,
    },
}

/// Source of the artifacts a worldview switch points at.
#[async_trait]
pub(crate) trait WorldviewCatalog: Send + Sync {
    async fn policy_bundle(&self, version: &str) -> Result<PolicyBundle, CatalogError>;
    async fn access_model(&self, id: &str) -> Result<AccessModel, CatalogError>;
}

pub(crate) struct FsCatalog {
    bundles_dir: PathBuf,
    access_models_dir: PathBuf,
}

impl FsCatalog {
    pub(crate) fn new(bundles_dir: impl Into<PathBuf>, access_models_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundles_dir: bundles_dir.into(),
            access_models_dir: access_models_dir.into(),
        }
    }
}

async fn read_named(dir: &Path, what: &'static str, id: &str, ext: &str) -> Result<String, CatalogError> {
    if !valid_id(id) {
        return Err(CatalogError::Invalid {
            what,
            id: id.to_string(),
            detail: "identifier must match [A-Za-z0-9._:-]{1,128}".into(),
        });
    }
    let path = dir.join(format!("{id}.{ext}"));
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(CatalogError::NotFound {
            what,
            id: id.to_string(),
        }),
        Err(err) => Err(CatalogError::Invalid {
            what,
            id: id.to_string(),
            detail: err.to_string(),
        }),
    }
}

#[async_trait]
impl WorldviewCatalog for FsCatalog {
    async fn policy_bundle(&self, version: &str) -> Result<PolicyBundle, CatalogError> {
        const WHAT: &str = "policy bundle";
        let text = read_named(&self.bundles_dir, WHAT, version, "toml").await?;
        let bundle: PolicyBundle = toml::from_str(&text).map_err(|e| CatalogError::Invalid {
            what: WHAT,
            id: version.to_string(),
            detail: e.to_string(),
        })?;
        if bundle.version != version {
            return Err(CatalogError::Invalid {
                what: WHAT,
                id: version.to_string(),
                detail: format!("file declares version '{}'", bundle.version),
            });
        }
        Ok(bundle)
    }

    async fn access_model(&self, id: &str) -> Result<AccessModel, CatalogError> {
        const WHAT: &str = "access model";
        let text = read_named(&self.access_models_dir, WHAT, id, "json").await?;
        let model: AccessModel = serde_json::from_str(&text).map_err(|e| CatalogError::Invalid {
            what: WHAT,
            id: id.to_string(),
            detail: e.to_string(),
        })?;
        if model.id != id {
            return Err(CatalogError::Invalid {
                what: WHAT,
                id: id.to_string(),
                detail: format!("file declares id '{}'", model.id),
            });
        }
        if model.schema_version.trim().is_empty() || model.type_definitions.is_empty() {
            return Err(CatalogError::Invalid {
                what: WHAT,
                id: id.to_string(),
                detail: "schema_version and type_definitions are required".into(),
            });
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_bundle_and_model_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let bundles = dir.path().join("bundles");
        let models = dir.path().join("models");
        std::fs::create_dir_all(&bundles).unwrap();
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(
            bundles.join("2024.06.toml"),
            "version = \"2024.06\"\n[thresholds]\nrisk = 0.7\nreview = { min_approvals = 2 }\n",
        )
        .unwrap();
        std::fs::write(
            models.join("model-b.json"),
            r#"{"id":"model-b","schema_version":"1.1","type_definitions":[{"type":"user"}]}"#,
        )
        .unwrap();
        let catalog = FsCatalog::new(&bundles, &models);
        let bundle = catalog.policy_bundle("2024.06").await.unwrap();
        assert_eq!(bundle.thresholds.len(), 2);
        assert_eq!(bundle.thresholds_hash().unwrap().len(), 64);
        let model = catalog.access_model("model-b").await.unwrap();
        assert_eq!(model.schema_version, "1.1");
    }

    #[tokio::test]
    async fn missing_and_malformed_files_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.toml"), "version = ").unwrap();
        let catalog = FsCatalog::new(dir.path(), dir.path());
        assert!(matches!(
            catalog.policy_bundle("nope").await,
            Err(CatalogError::NotFound { .. })
        ));
        assert!(matches!(
            catalog.policy_bundle("bad").await,
            Err(CatalogError::Invalid { .. })
        ));
        assert!(matches!(
            catalog.policy_bundle("../etc/passwd").await,
            Err(CatalogError::Invalid { .. })
        ));
    }

    #[test]
    fn thresholds_hash_ignores_key_order() {
        let a: PolicyBundle = toml::from_str("version = \"v\"\n[thresholds]\na = 1\nb = 2\n").unwrap();
        let b: PolicyBundle = toml::from_str("version = \"v\"\n[thresholds]\nb = 2\na = 1\n").unwrap();
        assert_eq!(a.thresholds_hash().unwrap(), b.thresholds_hash().unwrap());
    }
}
