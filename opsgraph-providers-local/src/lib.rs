//! A provider adapter for local resources.
//!
//! Serves two resource types:
//!
//! - `file`: a file on the local filesystem. The file path is the physical
//!   identifier.
//! - `memo`: a value held only in state; created once and echoed back
//!   unchanged. Useful in tests and as a source of reference targets.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use opsgraph_core::PhysicalId;
use opsgraph_provider::{
    CreateResponse, ProviderAdapter, ProviderError, ProviderResult, UpdateResponse,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileProperties {
    path: String,
    contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct MemoProperties {
    value: Value,
}

#[derive(Default)]
pub struct LocalProvider {
    memo_counter: AtomicU64,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_file(&self, props: FileProperties) -> ProviderResult<CreateResponse> {
        write_file(Path::new(&props.path), &props.contents)?;
        Ok(CreateResponse {
            physical_id: PhysicalId::new(&props.path),
            outputs: file_outputs(&props),
        })
    }

    fn update_file(
        &self,
        physical_id: &PhysicalId,
        props: FileProperties,
    ) -> ProviderResult<UpdateResponse> {
        if props.path != physical_id.as_str() {
            // A moved file is a different resource. Changing `path` needs a
            // delete and a create, which the engine expresses by removing
            // the old declaration.
            return Err(ProviderError::non_transient(format!(
                "file resource cannot move from {} to {}; declare a new resource instead",
                physical_id, props.path
            )));
        }
        write_file(Path::new(&props.path), &props.contents)?;
        Ok(UpdateResponse {
            outputs: file_outputs(&props),
        })
    }

    fn read_file(
        &self,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<BTreeMap<String, Value>>> {
        match std::fs::read_to_string(physical_id.as_str()) {
            Ok(contents) => Ok(Some(file_outputs(&FileProperties {
                path: physical_id.as_str().to_owned(),
                contents,
            }))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&e, format!("could not read {}", physical_id))),
        }
    }

    fn delete_file(&self, physical_id: &PhysicalId) -> ProviderResult<()> {
        match std::fs::remove_file(physical_id.as_str()) {
            Ok(()) => Ok(()),
            // Already gone; teardown is idempotent.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&e, format!("could not delete {}", physical_id))),
        }
    }

    fn create_memo(&self, props: MemoProperties) -> CreateResponse {
        let n = self.memo_counter.fetch_add(1, Ordering::Relaxed);
        let mut outputs = BTreeMap::new();
        outputs.insert("value".to_owned(), props.value);
        CreateResponse {
            physical_id: PhysicalId::new(format!("memo-{}", n)),
            outputs,
        }
    }
}

#[async_trait]
impl ProviderAdapter for LocalProvider {
    async fn create(
        &self,
        type_tag: &str,
        properties: &BTreeMap<String, Value>,
    ) -> ProviderResult<CreateResponse> {
        match type_tag {
            "file" => self.create_file(parse_properties(properties, type_tag)?),
            "memo" => Ok(self.create_memo(parse_properties(properties, type_tag)?)),
            t => Err(unknown_type(t)),
        }
    }

    async fn read(
        &self,
        type_tag: &str,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<BTreeMap<String, Value>>> {
        match type_tag {
            "file" => self.read_file(physical_id),
            // Memos have no provider-side existence to drift from.
            "memo" => Ok(None),
            t => Err(unknown_type(t)),
        }
    }

    async fn update(
        &self,
        type_tag: &str,
        physical_id: &PhysicalId,
        properties: &BTreeMap<String, Value>,
    ) -> ProviderResult<UpdateResponse> {
        match type_tag {
            "file" => self.update_file(physical_id, parse_properties(properties, type_tag)?),
            "memo" => {
                let props: MemoProperties = parse_properties(properties, type_tag)?;
                let mut outputs = BTreeMap::new();
                outputs.insert("value".to_owned(), props.value);
                Ok(UpdateResponse { outputs })
            }
            t => Err(unknown_type(t)),
        }
    }

    async fn delete(&self, type_tag: &str, physical_id: &PhysicalId) -> ProviderResult<()> {
        match type_tag {
            "file" => self.delete_file(physical_id),
            "memo" => Ok(()),
            t => Err(unknown_type(t)),
        }
    }
}

fn parse_properties<T: DeserializeOwned>(
    properties: &BTreeMap<String, Value>,
    type_tag: &str,
) -> ProviderResult<T> {
    let object: serde_json::Map<String, Value> = properties
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::from_value(Value::Object(object)).map_err(|e| {
        ProviderError::non_transient(format!(
            "could not deserialize input properties for {} resource: {}",
            type_tag, e
        ))
    })
}

fn file_outputs(props: &FileProperties) -> BTreeMap<String, Value> {
    let mut outputs = BTreeMap::new();
    outputs.insert("path".to_owned(), Value::String(props.path.clone()));
    outputs.insert("contents".to_owned(), Value::String(props.contents.clone()));
    outputs
}

fn write_file(path: &Path, contents: &str) -> ProviderResult<()> {
    std::fs::write(path, contents)
        .map_err(|e| io_error(&e, format!("could not write {}", path.display())))
}

fn io_error(e: &io::Error, context: String) -> ProviderError {
    let message = format!("{}: {}", context, e);
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
            ProviderError::transient(message)
        }
        _ => ProviderError::non_transient(message),
    }
}

fn unknown_type(type_tag: &str) -> ProviderError {
    ProviderError::non_transient(format!("LocalProvider: unknown resource type: {}", type_tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn file_create_read_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeting.txt");
        let path_str = path.to_string_lossy().to_string();
        let provider = LocalProvider::new();

        let created = provider
            .create(
                "file",
                &props(&[("path", json!(path_str)), ("contents", json!("hello"))]),
            )
            .await
            .unwrap();
        assert_eq!(created.physical_id.as_str(), path_str);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        let read = provider
            .read("file", &created.physical_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.get("contents"), Some(&json!("hello")));

        let updated = provider
            .update(
                "file",
                &created.physical_id,
                &props(&[("path", json!(path_str)), ("contents", json!("goodbye"))]),
            )
            .await
            .unwrap();
        assert_eq!(updated.outputs.get("contents"), Some(&json!("goodbye")));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "goodbye");

        provider.delete("file", &created.physical_id).await.unwrap();
        assert!(!path.exists());
        // Idempotent teardown
        provider.delete("file", &created.physical_id).await.unwrap();
    }

    #[tokio::test]
    async fn file_read_absent_is_none() {
        let provider = LocalProvider::new();
        let read = provider
            .read("file", &PhysicalId::new("/nonexistent/opsgraph-test"))
            .await
            .unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn file_update_cannot_move() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("a.txt").to_string_lossy().to_string();
        let new = dir.path().join("b.txt").to_string_lossy().to_string();
        let provider = LocalProvider::new();
        let err = provider
            .update(
                "file",
                &PhysicalId::new(&old),
                &props(&[("path", json!(new)), ("contents", json!("x"))]),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn memo_echoes_value_with_fresh_ids() {
        let provider = LocalProvider::new();
        let a = provider
            .create("memo", &props(&[("value", json!({"k": 1}))]))
            .await
            .unwrap();
        let b = provider
            .create("memo", &props(&[("value", json!(2))]))
            .await
            .unwrap();
        assert_eq!(a.outputs.get("value"), Some(&json!({"k": 1})));
        assert_eq!(b.outputs.get("value"), Some(&json!(2)));
        assert_ne!(a.physical_id, b.physical_id);
    }

    #[tokio::test]
    async fn unknown_type_is_non_transient() {
        let provider = LocalProvider::new();
        let err = provider.create("teleporter", &BTreeMap::new()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn bad_properties_are_non_transient() {
        let provider = LocalProvider::new();
        let err = provider
            .create("file", &props(&[("path", json!(42))]))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
