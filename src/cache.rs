//! Pipeline cache with single-flight construction.
//!
//! Pipelines are expensive to build (model loads) and cheap to share, so
//! the server keys them by a configuration fingerprint and builds each
//! fingerprint at most once, even under concurrent callers. The lock
//! discipline is a read-lock fast path plus a double-checked write lock;
//! construction runs under the write lock, which serializes builders for
//! *different* fingerprints too. That is deliberate: builds are rare and
//! the simplicity is worth the lost parallelism.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use xxhash_rust::xxh3::xxh3_64;

use crate::config::PipelineConfig;
use crate::error::{OcrError, OcrResult};
use crate::pipeline::{Engine, Pipeline};

/// Field separator for the fingerprint preimage. Unit-separator cannot
/// occur in paths or language tags, so the encoding is unambiguous.
const SEP: char = '\x1f';

/// 64-bit identity of a pipeline configuration.
///
/// Only fields that change which pipeline gets built participate:
/// models dir, model paths, the dictionary set (sorted, so list order
/// never splits the cache) and the language. Everything else can differ
/// between two configs that share one pipeline.
pub fn fingerprint(config: &PipelineConfig) -> u64 {
    let mut dicts: Vec<&PathBuf> = config.dictionary_paths.iter().collect();
    dicts.sort();

    let mut preimage = String::new();
    preimage.push_str(&config.models_dir.to_string_lossy());
    preimage.push(SEP);
    preimage.push_str(&config.detector_model_path.to_string_lossy());
    preimage.push(SEP);
    preimage.push_str(&config.recognizer_model_path.to_string_lossy());
    preimage.push(SEP);
    for dict in dicts {
        preimage.push_str(&dict.to_string_lossy());
        preimage.push(SEP);
    }
    preimage.push_str(&config.language);
    xxh3_64(preimage.as_bytes())
}

/// Generic keyed single-flight store. Kept separate from the pipeline so
/// the locking protocol is testable without loading models.
pub(crate) struct SingleFlight<T> {
    inner: RwLock<HashMap<u64, Arc<T>>>,
}

impl<T> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, building it at most once.
    /// A failed build inserts nothing; the next caller retries.
    pub(crate) fn get_or_create<F>(&self, key: u64, build: F) -> OcrResult<Arc<T>>
    where
        F: FnOnce() -> OcrResult<T>,
    {
        if let Some(hit) = self
            .inner
            .read()
            .map_err(|_| poisoned())?
            .get(&key)
        {
            return Ok(Arc::clone(hit));
        }

        let mut map = self.inner.write().map_err(|_| poisoned())?;
        // Double-check: another caller may have built while this one
        // waited on the write lock.
        if let Some(hit) = map.get(&key) {
            return Ok(Arc::clone(hit));
        }
        let built = Arc::new(build()?);
        map.insert(key, Arc::clone(&built));
        Ok(built)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Remove and return every entry.
    pub(crate) fn drain(&self) -> Vec<Arc<T>> {
        match self.inner.write() {
            Ok(mut map) => map.drain().map(|(_, v)| v).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn poisoned() -> OcrError {
    OcrError::Inference("pipeline cache lock poisoned".to_string())
}

/// Cache of built pipelines, keyed by [`fingerprint`].
pub struct PipelineCache {
    entries: SingleFlight<Pipeline>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self {
            entries: SingleFlight::new(),
        }
    }

    /// Fetch the pipeline for `config`, building it exactly once per
    /// unique fingerprint.
    pub fn get_or_create(&self, config: &PipelineConfig) -> OcrResult<Arc<Pipeline>> {
        self.entries
            .get_or_create(fingerprint(config), || Pipeline::new(config))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Close every cached pipeline. The first error is returned after all
    /// entries were attempted.
    pub fn close(&self) -> OcrResult<()> {
        let mut first_error = None;
        for pipeline in self.entries.drain() {
            if let Err(e) = pipeline.close() {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn fingerprint_ignores_dictionary_order() {
        let mut a = PipelineConfig::default();
        a.dictionary_paths = vec![PathBuf::from("en.txt"), PathBuf::from("de.txt")];
        let mut b = a.clone();
        b.dictionary_paths.reverse();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_separates_keyed_fields() {
        let base = PipelineConfig::default();
        let mut lang = base.clone();
        lang.language = "de".into();
        assert_ne!(fingerprint(&base), fingerprint(&lang));

        let mut det = base.clone();
        det.detector_model_path = PathBuf::from("other.onnx");
        assert_ne!(fingerprint(&base), fingerprint(&det));
    }

    #[test]
    fn fingerprint_ignores_non_keyed_fields() {
        let base = PipelineConfig::default();
        let mut tuned = base.clone();
        tuned.num_threads = 8;
        tuned.use_nms = true;
        tuned.batch_size = 99;
        assert_eq!(fingerprint(&base), fingerprint(&tuned));
    }

    #[test]
    fn fingerprint_delimiter_is_unambiguous() {
        // ("ab", "c") vs ("a", "bc") must not collide.
        let mut a = PipelineConfig::default();
        a.models_dir = PathBuf::from("ab");
        a.detector_model_path = PathBuf::from("c");
        let mut b = PipelineConfig::default();
        b.models_dir = PathBuf::from("a");
        b.detector_model_path = PathBuf::from("bc");
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn single_flight_builds_once_under_contention() {
        let cache = Arc::new(SingleFlight::<u64>::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                thread::spawn(move || {
                    cache
                        .get_or_create(42, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(10));
                            Ok(7u64)
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]), "all callers share one entry");
        }
    }

    #[test]
    fn failed_build_inserts_nothing_and_retries() {
        let cache = SingleFlight::<u64>::new();
        let err = cache.get_or_create(1, || {
            Err(crate::error::OcrError::InvalidInput("boom".into()))
        });
        assert!(err.is_err());
        assert_eq!(cache.len(), 0);

        let ok = cache.get_or_create(1, || Ok(5)).unwrap();
        assert_eq!(*ok, 5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_entries() {
        let cache = SingleFlight::<&'static str>::new();
        let a = cache.get_or_create(1, || Ok("a")).unwrap();
        let b = cache.get_or_create(2, || Ok("b")).unwrap();
        assert_eq!(*a, "a");
        assert_eq!(*b, "b");
        assert_eq!(cache.len(), 2);
    }
}
