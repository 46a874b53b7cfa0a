use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{data_count_name, Asset, StagedFile, StorageResult, Store};

#[derive(Debug, Default)]
struct Files {
    uploads: HashMap<String, Bytes>,
    global_models: HashMap<String, Bytes>,
    assets: HashMap<Asset, Bytes>,
    client_data: Option<Bytes>,
}

/// A [`Store`] keeping everything in memory. Useful to embed the coordinator without a
/// filesystem, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Arc<Mutex<Files>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a global model available, as the aggregator would.
    pub fn put_global_model(&self, name: &str, model: Bytes) {
        self.files
            .lock()
            .global_models
            .insert(name.to_string(), model);
    }

    pub fn put_asset(&self, asset: Asset, data: Bytes) {
        self.files.lock().assets.insert(asset, data);
    }

    /// Returns an uploaded file: a model or a data count.
    pub fn upload(&self, name: &str) -> Option<Bytes> {
        self.files.lock().uploads.get(name).cloned()
    }

    pub fn uploads_len(&self) -> usize {
        self.files.lock().uploads.len()
    }

    pub fn client_data(&self) -> Option<Bytes> {
        self.files.lock().client_data.clone()
    }
}

#[derive(Debug)]
enum Target {
    Upload(String),
    ClientData,
}

#[derive(Debug)]
struct MemoryStagedFile {
    files: Arc<Mutex<Files>>,
    target: Target,
    data: BytesMut,
}

#[async_trait]
impl StagedFile for MemoryStagedFile {
    async fn append(&mut self, chunk: &[u8]) -> StorageResult<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let Self {
            files,
            target,
            data,
        } = *self;
        let mut files = files.lock();
        match target {
            Target::Upload(name) => {
                files.uploads.insert(name, data.freeze());
            }
            Target::ClientData => files.client_data = Some(data.freeze()),
        }
        Ok(())
    }
}

impl MemoryStore {
    fn stage(&self, target: Target) -> Box<dyn StagedFile> {
        Box::new(MemoryStagedFile {
            files: Arc::clone(&self.files),
            target,
            data: BytesMut::new(),
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn stage_model(&self, name: &str) -> StorageResult<Box<dyn StagedFile>> {
        Ok(self.stage(Target::Upload(name.to_string())))
    }

    async fn save_data_count(&self, name: &str, count: &str) -> StorageResult<()> {
        self.files
            .lock()
            .uploads
            .insert(data_count_name(name), Bytes::copy_from_slice(count.as_bytes()));
        Ok(())
    }

    async fn discard_model(&self, name: &str) -> StorageResult<()> {
        self.files.lock().uploads.remove(name);
        Ok(())
    }

    async fn global_model(&self, name: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.files.lock().global_models.get(name).cloned())
    }

    async fn asset(&self, asset: Asset) -> StorageResult<Option<Bytes>> {
        Ok(self.files.lock().assets.get(&asset).cloned())
    }

    async fn stage_client_data(&self) -> StorageResult<Box<dyn StagedFile>> {
        Ok(self.stage(Target::ClientData))
    }
}
