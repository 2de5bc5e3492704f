//! Model artifacts
//!
//! Resolves a [`ModelPath`] to the model file an engine should open, and
//! checks the GGUF header before any native code touches it.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::error::{LoadError, LoadErrorKind};

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const GGUF_HEADER_LEN: u64 = 24;

/// Errors that can occur while inspecting model artifacts
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("No .gguf model file in directory: {0}")]
    NoModelFile(PathBuf),

    #[error("Failed to read model file: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("Model needs {needed} bytes, budget is {available}")]
    OverBudget { needed: u64, available: u64 },
}

impl From<ModelError> for LoadError {
    fn from(e: ModelError) -> Self {
        let kind = match &e {
            ModelError::NotFound(_) => LoadErrorKind::PathNotFound,
            ModelError::Io(err) if err.kind() == io::ErrorKind::NotFound => LoadErrorKind::PathNotFound,
            ModelError::Io(_) | ModelError::InvalidMagic(_) | ModelError::FileTooSmall => {
                LoadErrorKind::CorruptArtifacts
            }
            ModelError::NoModelFile(_) | ModelError::UnsupportedVersion(_) => LoadErrorKind::IncompatibleFormat,
            ModelError::OverBudget { .. } => LoadErrorKind::OutOfMemory,
        };
        LoadError::new(kind, e.to_string())
    }
}

/// Location of model artifacts: a directory holding a `.gguf` file, or the file itself
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelPath(PathBuf);

impl ModelPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ModelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for ModelPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModelPath {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<PathBuf> for ModelPath {
    fn from(p: PathBuf) -> Self {
        Self(p)
    }
}

impl From<&Path> for ModelPath {
    fn from(p: &Path) -> Self {
        Self::new(p)
    }
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// A model file that passed header validation
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub metadata: GgufMetadata,
}

impl ModelArtifact {
    /// Fails if the file alone would not fit in `budget_bytes`
    pub fn check_budget(&self, budget_bytes: Option<u64>) -> Result<(), ModelError> {
        match budget_bytes {
            Some(available) if self.size_bytes > available => Err(ModelError::OverBudget {
                needed: self.size_bytes,
                available,
            }),
            _ => Ok(()),
        }
    }
}

/// Resolves `path` to a validated model file.
///
/// A directory is scanned for `.gguf` files and the first one by name is
/// used; for split models this is the first shard, which pulls in the rest.
///
/// # Returns
/// * `Ok(ModelArtifact)` - The model file with its size and header metadata
/// * `Err(ModelError)` - If no readable GGUF file is found at `path`
pub fn resolve_artifact(path: &ModelPath) -> Result<ModelArtifact, ModelError> {
    let root = path.as_path();
    if !root.exists() {
        return Err(ModelError::NotFound(root.to_path_buf()));
    }

    let file = if root.is_dir() {
        find_model_files(root)?
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::NoModelFile(root.to_path_buf()))?
    } else {
        root.to_path_buf()
    };

    let metadata = validate_gguf(&file)?;
    let size_bytes = fs::metadata(&file)?.len();
    tracing::debug!("Resolved model artifact {} (GGUF v{})", file.display(), metadata.version);

    Ok(ModelArtifact {
        path: file,
        size_bytes,
        metadata,
    })
}

/// Lists `.gguf` files directly inside `directory`, sorted by file name
pub fn find_model_files(directory: &Path) -> Result<Vec<PathBuf>, ModelError> {
    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_file() && has_gguf_extension(&path) {
            models.push(path);
        }
    }

    models.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(models)
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < GGUF_HEADER_LEN {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // GGUF v2 and v3 are supported
    let version = read_u32(&mut file)?;
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(&mut file)?;
    let metadata_kv_count = read_u64(&mut file)?;

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

fn read_u32(file: &mut File) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(file: &mut File) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Writes a minimal GGUF header to `path`
    pub(crate) fn write_gguf_header(path: &Path, version: u32) {
        let mut file = File::create(path).unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&10u64.to_le_bytes()).unwrap();
        file.write_all(&5u64.to_le_bytes()).unwrap();
        file.flush().unwrap();
    }

    /// A temp directory laid out like a provisioned model
    pub(crate) fn model_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_gguf_header(&dir.path().join("model.gguf"), 3);
        fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        dir
    }

    #[test]
    fn test_validate_gguf_valid() {
        let dir = model_dir();
        let metadata = validate_gguf(dir.path().join("model.gguf")).unwrap();

        assert_eq!(metadata.version, 3);
        assert_eq!(metadata.tensor_count, 10);
        assert_eq!(metadata.metadata_kv_count, 5);
    }

    #[test]
    fn test_validate_gguf_invalid_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.gguf");
        let mut file = File::create(&path).unwrap();
        file.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        file.write_all(&[0u8; 20]).unwrap();
        file.flush().unwrap();

        let result = validate_gguf(&path);
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_validate_gguf_file_too_small() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.gguf");
        fs::write(&path, GGUF_MAGIC.to_le_bytes()).unwrap();

        assert!(matches!(validate_gguf(&path), Err(ModelError::FileTooSmall)));
    }

    #[test]
    fn test_resolve_directory_picks_first_gguf() {
        let dir = TempDir::new().unwrap();
        write_gguf_header(&dir.path().join("b-00002-of-00002.gguf"), 3);
        write_gguf_header(&dir.path().join("b-00001-of-00002.gguf"), 3);
        fs::write(dir.path().join("README.md"), "notes").unwrap();

        let artifact = resolve_artifact(&ModelPath::from(dir.path())).unwrap();
        assert!(artifact.path.ends_with("b-00001-of-00002.gguf"));
        assert_eq!(artifact.size_bytes, GGUF_HEADER_LEN);
    }

    #[test]
    fn test_resolve_file_directly() {
        let dir = model_dir();
        let artifact = resolve_artifact(&ModelPath::from(dir.path().join("model.gguf"))).unwrap();
        assert_eq!(artifact.metadata.version, 3);
    }

    #[test]
    fn test_load_error_classification() {
        let missing = LoadError::from(resolve_artifact(&ModelPath::from("missing/path")).unwrap_err());
        assert_eq!(missing.kind, LoadErrorKind::PathNotFound);

        let empty = TempDir::new().unwrap();
        let no_model = LoadError::from(resolve_artifact(&ModelPath::from(empty.path())).unwrap_err());
        assert_eq!(no_model.kind, LoadErrorKind::IncompatibleFormat);

        let old = TempDir::new().unwrap();
        write_gguf_header(&old.path().join("old.gguf"), 1);
        let version = LoadError::from(resolve_artifact(&ModelPath::from(old.path())).unwrap_err());
        assert_eq!(version.kind, LoadErrorKind::IncompatibleFormat);

        let corrupt = TempDir::new().unwrap();
        fs::write(corrupt.path().join("model.gguf"), b"truncated").unwrap();
        let short = LoadError::from(resolve_artifact(&ModelPath::from(corrupt.path())).unwrap_err());
        assert_eq!(short.kind, LoadErrorKind::CorruptArtifacts);
    }

    #[test]
    fn test_budget_check() {
        let dir = model_dir();
        let artifact = resolve_artifact(&ModelPath::from(dir.path())).unwrap();

        assert!(artifact.check_budget(None).is_ok());
        assert!(artifact.check_budget(Some(GGUF_HEADER_LEN)).is_ok());

        let error = artifact.check_budget(Some(GGUF_HEADER_LEN - 1)).unwrap_err();
        assert_eq!(LoadError::from(error).kind, LoadErrorKind::OutOfMemory);
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        assert!(has_gguf_extension(Path::new("model.GGUF")));
        assert!(!has_gguf_extension(Path::new("model.onnx")));
        assert!(!has_gguf_extension(Path::new("gguf")));
    }
}
