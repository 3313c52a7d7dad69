// Detector artifact validation
//
// Loaders are synchronous; the lifecycle manager runs them on the blocking pool.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::core::config::ModelLoaderKind;
use crate::core::errors::LoadError;

/// Zip local file header (PyTorch `.pt` archives)
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
/// Protobuf tag of `ModelProto.ir_version` (field 1, varint)
const ONNX_FIRST_TAG: u8 = 0x08;

/// Confirms that an artifact can be served before it replaces the current one
pub trait ModelLoader: Send + Sync {
    /// Load (or probe) the artifact at `path`, returning its format name
    fn load(&self, path: &Path) -> Result<String, LoadError>;

    fn name(&self) -> &'static str;
}

/// Header probe: a non-empty file in a known detector format
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeLoader;

impl ModelLoader for ProbeLoader {
    fn load(&self, path: &Path) -> Result<String, LoadError> {
        if !path.exists() {
            return Err(LoadError::Missing(path.to_path_buf()));
        }

        let mut header = [0u8; 4];
        let mut file = File::open(path)?;
        let read = file.read(&mut header)?;
        if read == 0 {
            return Err(LoadError::Empty(path.to_path_buf()));
        }

        let format = if read == header.len() && header == ZIP_MAGIC {
            "pytorch"
        } else if header[0] == ONNX_FIRST_TAG {
            "onnx"
        } else {
            return Err(LoadError::UnknownFormat {
                path: path.to_path_buf(),
            });
        };

        debug!("Probed {} as {}", path.display(), format);
        Ok(format.to_string())
    }

    fn name(&self) -> &'static str {
        "probe"
    }
}

/// Builds an ONNX Runtime session from the artifact
#[cfg(feature = "onnx")]
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxLoader;

#[cfg(feature = "onnx")]
impl ModelLoader for OnnxLoader {
    fn load(&self, path: &Path) -> Result<String, LoadError> {
        use ort::session::{builder::GraphOptimizationLevel, Session};

        if !path.exists() {
            return Err(LoadError::Missing(path.to_path_buf()));
        }
        if std::fs::metadata(path)?.len() == 0 {
            return Err(LoadError::Empty(path.to_path_buf()));
        }

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| LoadError::Rejected(e.to_string()))?;

        debug!(
            "Loaded {} with {} inputs / {} outputs",
            path.display(),
            session.inputs.len(),
            session.outputs.len()
        );
        Ok("onnx".to_string())
    }

    fn name(&self) -> &'static str {
        "onnx"
    }
}

pub fn loader_for(kind: ModelLoaderKind) -> Arc<dyn ModelLoader> {
    match kind {
        ModelLoaderKind::Probe => Arc::new(ProbeLoader),
        #[cfg(feature = "onnx")]
        ModelLoaderKind::Onnx => Arc::new(OnnxLoader),
    }
}
