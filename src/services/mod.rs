pub mod concept;
pub mod detection;
pub mod http;
pub mod model_manager;
pub mod ocr;
pub mod storage;

// Re-export commonly used services
pub use concept::{ConceptModel, OpenAiConceptModel};
pub use detection::{DetectionEngine, HttpDetectionEngine};
pub use http::StageHttpClient;
pub use model_manager::{LifecycleSettings, ModelLifecycleManager, ModelStatus, ServedModelSource};
pub use ocr::{HttpRecognitionEngine, RecognitionEngine};
pub use storage::{ArtifactStore, LabelStore};
