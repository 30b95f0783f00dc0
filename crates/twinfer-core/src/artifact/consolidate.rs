//! Rewriting models between the self-contained and external-data layouts.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::inspect::{ArtifactSummary, ExternalRef, InitializerInfo, model_dir, resolve_location};
use super::proto;
use crate::error::PortabilityError;

/// Result of [`consolidate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationOutcome {
    pub output: PathBuf,
    pub tensors_inlined: usize,
    pub bytes_inlined: u64,
    /// Side files deleted because nothing references them any more.
    pub removed_files: Vec<PathBuf>,
    /// The input had no external data to begin with.
    pub already_self_contained: bool,
}

/// Result of [`externalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalizeOutcome {
    pub output: PathBuf,
    /// `None` when no tensor reached the size threshold.
    pub data_file: Option<PathBuf>,
    pub tensors_moved: usize,
    pub bytes_moved: u64,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PortabilityError + '_ {
    move |source| PortabilityError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads external tensor bytes, loading each side file once.
struct ExternalReader {
    dir: PathBuf,
    files: HashMap<PathBuf, Vec<u8>>,
}

impl ExternalReader {
    fn new(model: &Path) -> Self {
        Self {
            dir: model_dir(model),
            files: HashMap::new(),
        }
    }

    fn path_of(&self, tensor: &InitializerInfo, external: &ExternalRef) -> Result<PathBuf, PortabilityError> {
        let location = external
            .location
            .as_deref()
            .ok_or_else(|| PortabilityError::MissingLocation(tensor.name.clone()))?;
        resolve_location(&self.dir, location)
    }

    fn read(&mut self, tensor: &InitializerInfo, external: &ExternalRef) -> Result<Vec<u8>, PortabilityError> {
        let path = self.path_of(tensor, external)?;

        if !self.files.contains_key(&path) {
            if !path.is_file() {
                return Err(PortabilityError::ExternalFileMissing(path));
            }
            let data = fs::read(&path).map_err(io_error(&path))?;
            debug!("Loaded {} bytes of external data from {}", data.len(), path.display());
            self.files.insert(path.clone(), data);
        }
        let data = &self.files[&path];
        let size = data.len() as u64;

        let start = external.offset;
        let end = match external.length {
            Some(len) => start.checked_add(len).unwrap_or(u64::MAX),
            None => size,
        };
        if start > size || end > size || start > end {
            return Err(PortabilityError::ExternalRange {
                name: tensor.name.clone(),
                path,
                offset: start,
                end,
                size,
            });
        }
        Ok(data[start as usize..end as usize].to_vec())
    }
}

/// Replace `path` atomically with `bytes`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PortabilityError> {
    let dir = model_dir(path);
    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_error(&dir))?;
    tmp.write_all(bytes).map_err(io_error(path))?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path).map_err(|e| PortabilityError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// `<model file name>.data`, next to the model.
pub fn default_data_path(model: &Path) -> PathBuf {
    let mut name = model.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".data");
    model.with_file_name(name)
}

/// Embed every externally stored initializer into a single model file.
///
/// `input` and `output` may be the same path. Running on an already
/// self-contained model rewrites identical bytes. Side files are only
/// deleted when nothing can still reference them: the referenced files when
/// rewriting in place, and a stale `<output>.data` left by an earlier export.
pub fn consolidate(input: &Path, output: &Path) -> Result<ConsolidationOutcome, PortabilityError> {
    let bytes = fs::read(input).map_err(io_error(input))?;
    let summary = ArtifactSummary::parse(&bytes)?;
    let in_place = same_file(input, output);

    let mut reader = ExternalReader::new(input);
    let mut referenced: BTreeSet<PathBuf> = BTreeSet::new();
    let mut tensors_inlined = 0;
    let mut bytes_inlined = 0u64;

    let rewritten = proto::rewrite_initializers(&bytes, |tensor| {
        let info = InitializerInfo::parse(tensor)?;
        let Some(external) = &info.external else {
            return Ok(None);
        };
        let data = reader.read(&info, external)?;
        referenced.insert(reader.path_of(&info, external)?);
        tensors_inlined += 1;
        bytes_inlined += data.len() as u64;
        Ok(Some(proto::inline_tensor(tensor, &data)?))
    })?;

    // Never leave a model that still points outside itself.
    let check = ArtifactSummary::parse(&rewritten)?;
    if check.external_data_present() {
        return Err(PortabilityError::Malformed(format!(
            "{} initializers still reference external data after consolidation",
            check.external_tensor_count()
        )));
    }

    write_atomic(output, &rewritten)?;

    let mut orphans: BTreeSet<PathBuf> = BTreeSet::new();
    if in_place {
        orphans.extend(referenced.iter().cloned());
    }
    let sibling = default_data_path(output);
    if sibling.is_file() && (in_place || !referenced.iter().any(|p| same_file(p, &sibling))) {
        orphans.insert(sibling);
    }

    let mut removed_files = Vec::new();
    for path in orphans {
        match fs::remove_file(&path) {
            Ok(()) => removed_files.push(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove orphaned data file {}: {}", path.display(), e),
        }
    }

    info!(
        "Consolidated {} -> {} ({} tensors, {} bytes inlined, {} side files removed)",
        input.display(),
        output.display(),
        tensors_inlined,
        bytes_inlined,
        removed_files.len()
    );

    Ok(ConsolidationOutcome {
        output: output.to_path_buf(),
        tensors_inlined,
        bytes_inlined,
        removed_files,
        already_self_contained: !summary.external_data_present(),
    })
}

/// Move every initializer of at least `min_bytes` into `<output>.data`.
///
/// Tensors that were already external in `input` are read back first, so the
/// output never depends on the input's side files. Only `raw_data` tensors
/// move; typed-field tensors stay embedded.
pub fn externalize(input: &Path, output: &Path, min_bytes: u64) -> Result<ExternalizeOutcome, PortabilityError> {
    let bytes = fs::read(input).map_err(io_error(input))?;
    ArtifactSummary::parse(&bytes)?;

    let data_path = default_data_path(output);
    let location = data_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| PortabilityError::UnsafeLocation(data_path.display().to_string()))?;

    let mut reader = ExternalReader::new(input);
    let mut data: Vec<u8> = Vec::new();
    let mut tensors_moved = 0;

    let rewritten = proto::rewrite_initializers(&bytes, |tensor| {
        let info = InitializerInfo::parse(tensor)?;
        let payload = match &info.external {
            Some(external) => reader.read(&info, external)?,
            None => match raw_data(tensor)? {
                Some(raw) => raw,
                None => return Ok(None),
            },
        };

        if (payload.len() as u64) < min_bytes {
            return match info.external {
                Some(_) => Ok(Some(proto::inline_tensor(tensor, &payload)?)),
                None => Ok(None),
            };
        }

        let offset = data.len() as u64;
        data.extend_from_slice(&payload);
        tensors_moved += 1;
        Ok(Some(proto::external_tensor(tensor, &location, offset, payload.len() as u64)?))
    })?;

    let data_file = if tensors_moved > 0 {
        write_atomic(&data_path, &data)?;
        Some(data_path)
    } else {
        None
    };
    write_atomic(output, &rewritten)?;

    info!(
        "Externalized {} tensors ({} bytes) from {} into {}",
        tensors_moved,
        data.len(),
        input.display(),
        output.display()
    );

    Ok(ExternalizeOutcome {
        output: output.to_path_buf(),
        data_file,
        tensors_moved,
        bytes_moved: data.len() as u64,
    })
}

fn raw_data(tensor: &[u8]) -> Result<Option<Vec<u8>>, PortabilityError> {
    for field in proto::fields(tensor)? {
        if field.number == proto::TENSOR_RAW_DATA {
            return Ok(Some(field.message()?.to_vec()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::inspect::inspect;
    use crate::artifact::proto::fixtures::add_model;
    use pretty_assertions::assert_eq;

    fn setup(weights: &[f32]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        fs::write(&model, add_model(weights)).unwrap();
        (dir, model)
    }

    #[test]
    fn test_externalize_then_consolidate() {
        let (dir, original) = setup(&[1.0, 2.0, 3.0, 4.0]);
        let split = dir.path().join("split.onnx");

        let moved = externalize(&original, &split, 8).unwrap();
        assert_eq!(moved.tensors_moved, 1);
        assert_eq!(moved.bytes_moved, 16);
        assert_eq!(moved.data_file, Some(dir.path().join("split.onnx.data")));

        let report = inspect(&split).unwrap();
        assert!(report.external_data_present);
        assert_eq!(report.external_tensor_count, 1);

        let single = dir.path().join("single.onnx");
        let outcome = consolidate(&split, &single).unwrap();
        assert_eq!(outcome.tensors_inlined, 1);
        assert_eq!(outcome.bytes_inlined, 16);
        assert!(!outcome.already_self_contained);
        // not in place: the split model still needs its data file
        assert!(outcome.removed_files.is_empty());
        assert!(dir.path().join("split.onnx.data").exists());

        let report = inspect(&single).unwrap();
        assert!(!report.external_data_present);
        assert_eq!(report.inline_weight_bytes, 20);
    }

    #[test]
    fn test_consolidate_is_idempotent() {
        let (dir, original) = setup(&[1.0, 2.0]);
        let split = dir.path().join("split.onnx");
        externalize(&original, &split, 0).unwrap();

        let single = dir.path().join("single.onnx");
        consolidate(&split, &single).unwrap();
        let first = fs::read(&single).unwrap();

        let again = consolidate(&single, &single).unwrap();
        assert!(again.already_self_contained);
        assert_eq!(again.tensors_inlined, 0);
        assert_eq!(fs::read(&single).unwrap(), first);
    }

    #[test]
    fn test_self_contained_rewrite_is_byte_identical() {
        let (_dir, model) = setup(&[0.25, 0.5]);
        let before = fs::read(&model).unwrap();
        consolidate(&model, &model).unwrap();
        assert_eq!(fs::read(&model).unwrap(), before);
    }

    #[test]
    fn test_in_place_removes_orphaned_data() {
        let (dir, original) = setup(&[1.0, 2.0, 3.0]);
        let split = dir.path().join("split.onnx");
        externalize(&original, &split, 0).unwrap();
        let data = dir.path().join("split.onnx.data");
        assert!(data.exists());

        let outcome = consolidate(&split, &split).unwrap();
        assert_eq!(outcome.removed_files, vec![data.clone()]);
        assert!(!data.exists());
        assert!(inspect(&split).unwrap().is_self_contained());
    }

    #[test]
    fn test_stale_sibling_is_removed() {
        let (dir, model) = setup(&[1.0]);
        let out = dir.path().join("single.onnx");
        let stale = dir.path().join("single.onnx.data");
        fs::write(&stale, [0u8; 4]).unwrap();

        let outcome = consolidate(&model, &out).unwrap();
        assert_eq!(outcome.removed_files, vec![stale.clone()]);
        assert!(!stale.exists());
    }

    #[test]
    fn test_missing_data_file() {
        let (dir, original) = setup(&[1.0, 2.0]);
        let split = dir.path().join("split.onnx");
        externalize(&original, &split, 0).unwrap();
        fs::remove_file(dir.path().join("split.onnx.data")).unwrap();

        let err = consolidate(&split, &dir.path().join("out.onnx")).unwrap_err();
        assert!(matches!(err, PortabilityError::ExternalFileMissing(_)));
        assert!(!dir.path().join("out.onnx").exists());
    }

    #[test]
    fn test_truncated_data_file() {
        let (dir, original) = setup(&[1.0, 2.0, 3.0]);
        let split = dir.path().join("split.onnx");
        externalize(&original, &split, 8).unwrap();
        fs::write(dir.path().join("split.onnx.data"), [0u8; 5]).unwrap();

        let err = consolidate(&split, &dir.path().join("out.onnx")).unwrap_err();
        assert!(matches!(err, PortabilityError::ExternalRange { end: 12, size: 5, .. }));
    }

    #[test]
    fn test_threshold_keeps_small_tensors_inline() {
        let (dir, original) = setup(&[1.0, 2.0]);
        let out = dir.path().join("out.onnx");
        let outcome = externalize(&original, &out, 1024).unwrap();
        assert_eq!(outcome.tensors_moved, 0);
        assert_eq!(outcome.data_file, None);
        assert!(!dir.path().join("out.onnx.data").exists());
        assert_eq!(fs::read(&out).unwrap(), fs::read(&original).unwrap());
    }

    #[test]
    fn test_default_data_path() {
        assert_eq!(
            default_data_path(Path::new("models/resnet18.onnx")),
            PathBuf::from("models/resnet18.onnx.data")
        );
    }

    #[cfg(feature = "portable")]
    #[test]
    fn test_consolidated_model_loads_from_bytes() {
        use twinfer_inference::{InferenceBackend, InputTensor, TractBackend};

        let (dir, original) = setup(&[1.0, 2.0, 3.0, 4.0]);
        let split = dir.path().join("split.onnx");
        externalize(&original, &split, 0).unwrap();
        let single = dir.path().join("single.onnx");
        consolidate(&split, &single).unwrap();

        let bytes = fs::read(&single).unwrap();
        let backend = TractBackend::from_bytes_with_shape(&bytes, &[4]).unwrap();
        let input = InputTensor::from_vec(&[4], vec![10.0, 20.0, 30.0, 40.0]).unwrap();
        let scores = backend.run(&input).unwrap().into_scores().unwrap();
        assert_eq!(scores, vec![11.0, 22.0, 33.0, 44.0]);
    }
}
