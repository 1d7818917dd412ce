//! Test doubles: a colour-keyed fake face analyzer and an object store with
//! injectable failures.

use crate::analysis::{AnalysisError, FaceAnalysis};
use crate::config::PipelineConfig;
use crate::orchestrator::{Pipeline, PhotoJob};
use async_trait::async_trait;
use facetag_core::{BoundingBox, DetectedFace, Embedding};
use facetag_store::{
    FsObjectStore, Identity, IdentityRegistry, ObjectStore, ObjectStoreError, OwnerId, ReferenceImage,
};
use image::{Rgb, RgbImage};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const PEOPLE: usize = 16;

/// Crop colour of person `k` (`k < 16`). The red channel encodes the person.
pub(crate) fn person(k: u8) -> [u8; 3] {
    [k * 16, 128, 64]
}

/// One-hot embedding, so distinct people are orthogonal.
pub(crate) fn embedding_of(colour: [u8; 3]) -> Embedding {
    let mut values = vec![0.0; PEOPLE];
    values[(colour[0] / 16) as usize] = 1.0;
    Embedding::new(values)
}

pub(crate) fn crop_of(k: u8) -> RgbImage {
    RgbImage::from_pixel(8, 8, Rgb(person(k)))
}

pub(crate) fn face(k: u8) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 8.0,
            height: 8.0,
            confidence: 0.9,
            landmarks: None,
        },
        embedding: embedding_of(person(k)),
        crop: crop_of(k),
    }
}

/// Analyzer that knows which people are in which image path.
#[derive(Default)]
pub(crate) struct FakeAnalysis {
    photos: Mutex<HashMap<PathBuf, Vec<u8>>>,
    failing: Mutex<HashSet<PathBuf>>,
    delay: Mutex<Option<Duration>>,
    pub detect_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
}

impl FakeAnalysis {
    pub fn add_photo(&self, path: &Path, people: &[u8]) {
        self.photos.lock().unwrap().insert(path.to_path_buf(), people.to_vec());
    }

    pub fn fail_on(&self, path: &Path) {
        self.failing.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl FaceAnalysis for FakeAnalysis {
    async fn detect_faces(&self, image_path: &Path) -> Result<Vec<DetectedFace>, AnalysisError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(image_path) {
            return Err(AnalysisError::EngineStopped);
        }
        let people = self.photos.lock().unwrap().get(image_path).cloned().unwrap_or_default();
        Ok(people.into_iter().map(face).collect())
    }

    async fn embed(&self, crop: RgbImage) -> Result<Embedding, AnalysisError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(embedding_of(crop.get_pixel(0, 0).0))
    }
}

/// Filesystem object store that counts reads and fails on request.
pub(crate) struct TestStore {
    inner: FsObjectStore,
    failing_gets: Mutex<HashSet<String>>,
    fail_puts: AtomicBool,
    pub gets: AtomicUsize,
}

impl TestStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            inner: FsObjectStore::new(root),
            failing_gets: Mutex::new(HashSet::new()),
            fail_puts: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
        }
    }

    pub fn fail_get(&self, path: &str) {
        self.failing_gets.lock().unwrap().insert(path.to_string());
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for TestStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Io {
                path: path.to_string(),
                source: std::io::Error::other("injected put failure"),
            });
        }
        self.inner.put(path, bytes).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.failing_gets.lock().unwrap().contains(path) {
            return Err(ObjectStoreError::Io {
                path: path.to_string(),
                source: std::io::Error::other("injected get failure"),
            });
        }
        self.inner.get(path).await
    }
}

/// A pipeline over an in-memory registry, fakes and a temp directory.
pub(crate) struct Harness {
    pub dir: TempDir,
    pub pipeline: Pipeline,
    pub analysis: Arc<FakeAnalysis>,
    pub store: Arc<TestStore>,
    pub owner: OwnerId,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TestStore::new(dir.path().join("objects")));
        let analysis = Arc::new(FakeAnalysis::default());
        let registry = IdentityRegistry::open_in_memory(store.clone()).await.unwrap();

        let mut config = PipelineConfig {
            cache_dir: dir.path().join("cache"),
            ..PipelineConfig::default()
        };
        tweak(&mut config);
        let pipeline = Pipeline::new(registry, analysis.clone(), config).unwrap();

        Self {
            dir,
            pipeline,
            analysis,
            store,
            owner: OwnerId::generate(),
        }
    }

    /// Register a photo of `people` for the default owner.
    pub async fn photo(&self, people: &[u8]) -> PhotoJob {
        self.photo_for(self.owner, people).await
    }

    pub async fn photo_for(&self, owner_id: OwnerId, people: &[u8]) -> PhotoJob {
        let registry = self.pipeline.registry();
        let count = registry.count_identities(owner_id).await.unwrap();
        let photo = registry
            .register_photo(owner_id, &format!("photos/{owner_id}/{count}.jpg"))
            .await
            .unwrap();
        let file_path = self.dir.path().join(format!("{}.jpg", photo.id));
        self.analysis.add_photo(&file_path, people);
        PhotoJob {
            file_path,
            owner_id,
            photo_id: photo.id,
        }
    }

    /// Register person `k` directly, as if an earlier job had.
    pub async fn register_person(&self, owner_id: OwnerId, k: u8) -> Identity {
        let mut bytes = Vec::new();
        crop_of(k)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let reference = ReferenceImage::new(bytes, "png").unwrap();
        self.pipeline
            .registry()
            .register_identity(owner_id, reference)
            .await
            .unwrap()
    }
}
