//! Inference session wrapper.
//!
//! The ONNX runtime is the one external collaborator of the pipeline. A
//! [`InferenceSession`] owns one compiled graph and exposes exactly two
//! operations: `run` and `close`. Runs are serialized per session with a
//! mutex, which keeps the session shareable across concurrent pipeline
//! calls without requiring the runtime itself to be thread-safe.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::{Array4, ArrayD};
use ort::{
    inputs,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};

use crate::error::{OcrError, OcrResult};

pub struct InferenceSession {
    path: PathBuf,
    // None once closed. run() on a closed session reports Closed rather
    // than panicking, since cached pipelines may race shutdown.
    session: Mutex<Option<Session>>,
}

impl InferenceSession {
    /// Load and compile a model graph from `path`.
    ///
    /// `num_threads` bounds intra-op parallelism; 0 leaves the runtime
    /// default in place.
    pub fn load(path: &Path, num_threads: usize) -> OcrResult<Self> {
        let mut builder = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .map_err(|e| OcrError::ModelLoad {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if num_threads > 0 {
            builder = builder
                .with_intra_threads(num_threads)
                .map_err(|e| OcrError::ModelLoad {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }
        let session = builder
            .commit_from_file(path)
            .map_err(|e| OcrError::ModelLoad {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            session: Mutex::new(Some(session)),
        })
    }

    /// Execute the graph on one input tensor and return the first output.
    pub fn run(&self, input: &Array4<f32>) -> OcrResult<ArrayD<f32>> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| OcrError::Inference("session lock poisoned".to_string()))?;
        let session = guard.as_mut().ok_or(OcrError::Closed)?;

        let tensor: TensorRef<f32> = TensorRef::from_array_view(input)
            .map_err(|e| OcrError::Inference(e.to_string()))?;
        let outputs = session
            .run(inputs![tensor])
            .map_err(|e| OcrError::Inference(format!("{}: {e}", self.path.display())))?;
        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| OcrError::Inference(e.to_string()))?;
        Ok(output.into_owned())
    }

    /// Release the compiled graph. Idempotent.
    pub fn close(&self) -> OcrResult<()> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| OcrError::Inference("session lock poisoned".to_string()))?;
        guard.take();
        Ok(())
    }

    pub fn model_path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
