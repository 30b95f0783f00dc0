//! Read-only portability inspection.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::proto::{self, Field};
use crate::error::PortabilityError;

/// Where an externally stored tensor keeps its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    pub location: Option<String>,
    pub offset: u64,
    /// `None` means "to the end of the file".
    pub length: Option<u64>,
}

/// One graph initializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializerInfo {
    pub name: String,
    pub data_type: i32,
    pub dims: Vec<i64>,
    /// Size of the embedded `raw_data`, zero for external tensors.
    pub inline_bytes: u64,
    pub external: Option<ExternalRef>,
}

impl InitializerInfo {
    pub(crate) fn parse(tensor: &[u8]) -> Result<Self, PortabilityError> {
        let mut info = InitializerInfo {
            name: String::new(),
            data_type: 0,
            dims: Vec::new(),
            inline_bytes: 0,
            external: None,
        };
        let mut entries: Vec<(String, String)> = Vec::new();
        let mut location_flag = false;

        for field in proto::fields(tensor)? {
            match field.number {
                proto::TENSOR_DIMS => proto::push_int64s(&field, &mut info.dims)?,
                proto::TENSOR_DATA_TYPE => info.data_type = field.varint().unwrap_or(0) as i32,
                proto::TENSOR_NAME => info.name = field.string()?.to_string(),
                proto::TENSOR_RAW_DATA => info.inline_bytes = field.message()?.len() as u64,
                proto::TENSOR_EXTERNAL_DATA => entries.push(parse_entry(&field)?),
                proto::TENSOR_DATA_LOCATION => {
                    location_flag = field.varint() == Some(proto::DATA_LOCATION_EXTERNAL)
                }
                _ => {}
            }
        }

        if location_flag || !entries.is_empty() {
            let mut external = ExternalRef {
                location: None,
                offset: 0,
                length: None,
            };
            for (key, value) in entries {
                match key.as_str() {
                    "location" => external.location = Some(value),
                    "offset" => external.offset = parse_number(&info.name, &key, &value)?,
                    "length" => external.length = Some(parse_number(&info.name, &key, &value)?),
                    // checksum and friends are informational
                    _ => {}
                }
            }
            info.external = Some(external);
        }

        Ok(info)
    }
}

fn parse_entry(field: &Field<'_>) -> Result<(String, String), PortabilityError> {
    let mut key = String::new();
    let mut value = String::new();
    for f in proto::fields(field.message()?)? {
        match f.number {
            proto::ENTRY_KEY => key = f.string()?.to_string(),
            proto::ENTRY_VALUE => value = f.string()?.to_string(),
            _ => {}
        }
    }
    Ok((key, value))
}

fn parse_number(tensor: &str, key: &str, value: &str) -> Result<u64, PortabilityError> {
    value.trim().parse().map_err(|_| {
        PortabilityError::Malformed(format!(
            "tensor '{}' has non-numeric external {} '{}'",
            tensor, key, value
        ))
    })
}

/// What a model file says about itself, without touching the filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub ir_version: Option<i64>,
    pub producer_name: Option<String>,
    /// Version of the default (`ai.onnx`) operator set.
    pub opset_version: Option<i64>,
    pub graph_name: Option<String>,
    pub node_count: usize,
    pub initializers: Vec<InitializerInfo>,
}

impl ArtifactSummary {
    /// Parse an in-memory model. Fails unless the bytes hold a model with a graph.
    pub fn parse(bytes: &[u8]) -> Result<Self, PortabilityError> {
        let mut summary = ArtifactSummary {
            ir_version: None,
            producer_name: None,
            opset_version: None,
            graph_name: None,
            node_count: 0,
            initializers: Vec::new(),
        };
        let mut saw_graph = false;

        for field in proto::fields(bytes)? {
            match field.number {
                proto::MODEL_IR_VERSION => summary.ir_version = field.varint().map(|v| v as i64),
                proto::MODEL_PRODUCER_NAME => {
                    summary.producer_name = Some(field.string()?.to_string())
                }
                proto::MODEL_OPSET_IMPORT => {
                    let mut domain = "";
                    let mut version = None;
                    for f in proto::fields(field.message()?)? {
                        match f.number {
                            proto::OPSET_DOMAIN => domain = f.string()?,
                            proto::OPSET_VERSION => version = f.varint().map(|v| v as i64),
                            _ => {}
                        }
                    }
                    if domain.is_empty() || domain == "ai.onnx" {
                        summary.opset_version = version;
                    }
                }
                proto::MODEL_GRAPH => {
                    saw_graph = true;
                    summary.read_graph(field.message()?)?;
                }
                _ => {}
            }
        }

        if !saw_graph {
            return Err(PortabilityError::MissingGraph);
        }
        Ok(summary)
    }

    fn read_graph(&mut self, graph: &[u8]) -> Result<(), PortabilityError> {
        for field in proto::fields(graph)? {
            match field.number {
                proto::GRAPH_NODE => {
                    // walk it once so a corrupt node surfaces here
                    proto::fields(field.message()?)?;
                    self.node_count += 1;
                }
                proto::GRAPH_NAME => self.graph_name = Some(field.string()?.to_string()),
                proto::GRAPH_INITIALIZER => {
                    self.initializers.push(InitializerInfo::parse(field.message()?)?)
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether any initializer lives outside the model file.
    pub fn external_data_present(&self) -> bool {
        self.initializers.iter().any(|i| i.external.is_some())
    }

    pub fn external_tensor_count(&self) -> usize {
        self.initializers.iter().filter(|i| i.external.is_some()).count()
    }

    pub fn inline_weight_bytes(&self) -> u64 {
        self.initializers.iter().map(|i| i.inline_bytes).sum()
    }
}

/// Resolve an external-data location against the model's directory.
///
/// Locations must stay inside that directory.
pub(crate) fn resolve_location(model_dir: &Path, location: &str) -> Result<PathBuf, PortabilityError> {
    let relative = Path::new(location);
    let escapes = relative.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if location.is_empty() || relative.is_absolute() || escapes {
        return Err(PortabilityError::UnsafeLocation(location.to_string()));
    }
    Ok(model_dir.join(relative))
}

/// Directory external locations are relative to.
pub(crate) fn model_dir(model: &Path) -> PathBuf {
    match model.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// A side file referenced by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalFile {
    pub location: String,
    pub path: PathBuf,
    pub exists: bool,
    pub size: Option<u64>,
    /// Number of initializers stored in this file.
    pub tensors: usize,
}

/// Portability facts about one model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortabilityReport {
    pub path: PathBuf,
    pub file_size: u64,
    pub external_data_present: bool,
    /// Combined size of the referenced side files that exist.
    pub external_data_size: Option<u64>,
    pub external_tensor_count: usize,
    pub initializer_count: usize,
    pub inline_weight_bytes: u64,
    pub external_files: Vec<ExternalFile>,
    pub ir_version: Option<i64>,
    pub opset_version: Option<i64>,
    pub producer_name: Option<String>,
}

impl PortabilityReport {
    /// Loadable from its own bytes, with no side files.
    pub fn is_self_contained(&self) -> bool {
        !self.external_data_present
    }

    /// Every referenced side file is present.
    pub fn side_files_present(&self) -> bool {
        self.external_files.iter().all(|f| f.exists)
    }
}

/// Inspect a model file on disk.
///
/// Missing side files are reported, not treated as errors; unsafe locations
/// are.
pub fn inspect(path: &Path) -> Result<PortabilityReport, PortabilityError> {
    let bytes = fs::read(path).map_err(|source| PortabilityError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let summary = ArtifactSummary::parse(&bytes)?;
    let dir = model_dir(path);

    let mut files: BTreeMap<String, ExternalFile> = BTreeMap::new();
    for init in &summary.initializers {
        let Some(external) = &init.external else {
            continue;
        };
        let location = external
            .location
            .as_deref()
            .ok_or_else(|| PortabilityError::MissingLocation(init.name.clone()))?;

        if let Some(file) = files.get_mut(location) {
            file.tensors += 1;
            continue;
        }
        let resolved = resolve_location(&dir, location)?;
        let size = fs::metadata(&resolved).ok().map(|m| m.len());
        files.insert(
            location.to_string(),
            ExternalFile {
                location: location.to_string(),
                path: resolved,
                exists: size.is_some(),
                size,
                tensors: 1,
            },
        );
    }

    let external_files: Vec<ExternalFile> = files.into_values().collect();
    let external_data_size = if external_files.is_empty() {
        None
    } else {
        Some(external_files.iter().filter_map(|f| f.size).sum())
    };

    Ok(PortabilityReport {
        path: path.to_path_buf(),
        file_size: bytes.len() as u64,
        external_data_present: summary.external_data_present(),
        external_data_size,
        external_tensor_count: summary.external_tensor_count(),
        initializer_count: summary.initializers.len(),
        inline_weight_bytes: summary.inline_weight_bytes(),
        external_files,
        ir_version: summary.ir_version,
        opset_version: summary.opset_version,
        producer_name: summary.producer_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::proto::fixtures::{add_model, float_tensor};
    use crate::artifact::proto::{GRAPH_INITIALIZER, MODEL_GRAPH, external_tensor, put_bytes};
    use pretty_assertions::assert_eq;

    /// Model whose only initializer points at `location`.
    fn external_model(location: &str, length: u64) -> Vec<u8> {
        let tensor = external_tensor(&float_tensor("w", &[1.0, 2.0]), location, 0, length).unwrap();
        let mut graph = Vec::new();
        put_bytes(&mut graph, GRAPH_INITIALIZER, &tensor);
        let mut model = Vec::new();
        put_bytes(&mut model, MODEL_GRAPH, &graph);
        model
    }

    #[test]
    fn test_summary_of_self_contained_model() {
        let summary = ArtifactSummary::parse(&add_model(&[1.0, 2.0, 3.0])).unwrap();
        assert_eq!(summary.ir_version, Some(7));
        assert_eq!(summary.opset_version, Some(13));
        assert_eq!(summary.producer_name.as_deref(), Some("twinfer-tests"));
        assert_eq!(summary.graph_name.as_deref(), Some("tiny"));
        assert_eq!(summary.node_count, 1);
        assert_eq!(summary.initializers.len(), 2);
        assert_eq!(summary.initializers[0].dims, vec![3]);
        assert_eq!(summary.inline_weight_bytes(), 16);
        assert!(!summary.external_data_present());
    }

    #[test]
    fn test_summary_detects_external_tensor() {
        let summary = ArtifactSummary::parse(&external_model("w.bin", 8)).unwrap();
        assert!(summary.external_data_present());
        assert_eq!(summary.external_tensor_count(), 1);
        assert_eq!(
            summary.initializers[0].external,
            Some(ExternalRef {
                location: Some("w.bin".into()),
                offset: 0,
                length: Some(8),
            })
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            ArtifactSummary::parse(b"not an onnx model at all"),
            Err(PortabilityError::Malformed(_))
        ));
        assert!(matches!(ArtifactSummary::parse(&[]), Err(PortabilityError::MissingGraph)));
    }

    #[test]
    fn test_inspect_reports_side_files() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        std::fs::write(&model, external_model("model.onnx.data", 8)).unwrap();
        std::fs::write(dir.path().join("model.onnx.data"), [0u8; 8]).unwrap();

        let report = inspect(&model).unwrap();
        assert!(report.external_data_present);
        assert!(!report.is_self_contained());
        assert!(report.side_files_present());
        assert_eq!(report.external_data_size, Some(8));
        assert_eq!(report.external_files[0].tensors, 1);
    }

    #[test]
    fn test_inspect_missing_side_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        std::fs::write(&model, external_model("gone.data", 8)).unwrap();

        let report = inspect(&model).unwrap();
        assert!(!report.side_files_present());
        assert_eq!(report.external_data_size, Some(0));
    }

    #[test]
    fn test_inspect_self_contained() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        std::fs::write(&model, add_model(&[1.0])).unwrap();

        let report = inspect(&model).unwrap();
        assert!(report.is_self_contained());
        assert_eq!(report.external_data_size, None);
        assert!(report.external_files.is_empty());
    }

    #[test]
    fn test_unsafe_locations() {
        let dir = Path::new("/models");
        assert!(resolve_location(dir, "weights.bin").is_ok());
        assert!(resolve_location(dir, "sub/weights.bin").is_ok());
        for bad in ["../weights.bin", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(resolve_location(dir, bad), Err(PortabilityError::UnsafeLocation(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_model_dir_of_bare_file_name() {
        assert_eq!(model_dir(Path::new("model.onnx")), PathBuf::from("."));
        assert_eq!(model_dir(Path::new("a/model.onnx")), PathBuf::from("a"));
    }
}
