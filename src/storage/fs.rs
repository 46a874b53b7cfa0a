use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
};

use super::{data_count_name, Asset, StagedFile, StorageResult, Store};
use crate::{protocol::CHUNK_SIZE, settings::StorageSettings};

/// A [`Store`] backed by the directory layout the aggregation process reads from.
#[derive(Debug, Clone)]
pub struct FsStore {
    uploads_dir: PathBuf,
    global_model_dir: PathBuf,
    base_model_dir: PathBuf,
    base_model_file: String,
    client_data_file: PathBuf,
}

impl FsStore {
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            uploads_dir: settings.uploads_dir.clone(),
            global_model_dir: settings.global_model_dir.clone(),
            base_model_dir: settings.base_model_dir.clone(),
            base_model_file: settings.base_model_file.clone(),
            client_data_file: settings.client_data_file.clone(),
        }
    }

    async fn read_optional(path: &Path) -> StorageResult<Option<Bytes>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
    }
}

/// A file written next to its final path under a unique temporary name, and renamed into
/// place on commit. The aggregator never sees a partially written file, and concurrent
/// writers of the same path never share a temporary file.
#[derive(Debug)]
struct FsStagedFile {
    file: Option<BufWriter<fs::File>>,
    tmp: PathBuf,
    path: PathBuf,
    committed: bool,
}

impl FsStagedFile {
    async fn create(path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".{:016x}.part", rand::random::<u64>()));
        let tmp = PathBuf::from(tmp);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .await
            .with_context(|| format!("cannot create {}", tmp.display()))?;
        Ok(Self {
            file: Some(BufWriter::with_capacity(CHUNK_SIZE, file)),
            tmp,
            path,
            committed: false,
        })
    }

    async fn write(path: PathBuf, data: &[u8]) -> StorageResult<()> {
        let mut staged = Box::new(Self::create(path).await?);
        staged.append(data).await?;
        staged.commit().await
    }
}

#[async_trait]
impl StagedFile for FsStagedFile {
    async fn append(&mut self, chunk: &[u8]) -> StorageResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("{} is closed", self.tmp.display()))?;
        file.write_all(chunk)
            .await
            .with_context(|| format!("cannot write {}", self.tmp.display()))
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| anyhow!("{} is closed", self.tmp.display()))?;
        file.flush()
            .await
            .with_context(|| format!("cannot write {}", self.tmp.display()))?;
        drop(file);
        fs::rename(&self.tmp, &self.path)
            .await
            .with_context(|| format!("cannot move {} into place", self.tmp.display()))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for FsStagedFile {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

#[async_trait]
impl Store for FsStore {
    async fn stage_model(&self, name: &str) -> StorageResult<Box<dyn StagedFile>> {
        let staged = FsStagedFile::create(self.uploads_dir.join(name)).await?;
        Ok(Box::new(staged))
    }

    async fn save_data_count(&self, name: &str, count: &str) -> StorageResult<()> {
        let path = self.uploads_dir.join(data_count_name(name));
        FsStagedFile::write(path, count.as_bytes()).await
    }

    async fn discard_model(&self, name: &str) -> StorageResult<()> {
        let path = self.uploads_dir.join(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
        }
    }

    async fn global_model(&self, name: &str) -> StorageResult<Option<Bytes>> {
        Self::read_optional(&self.global_model_dir.join(name)).await
    }

    async fn asset(&self, asset: Asset) -> StorageResult<Option<Bytes>> {
        let path = match asset {
            Asset::BaseModel => self.base_model_dir.join(&self.base_model_file),
            Asset::MinValues => self.base_model_dir.join("min_vals.txt"),
            Asset::MaxValues => self.base_model_dir.join("max_vals.txt"),
        };
        Self::read_optional(&path).await
    }

    async fn stage_client_data(&self) -> StorageResult<Box<dyn StagedFile>> {
        let staged = FsStagedFile::create(self.client_data_file.clone()).await?;
        Ok(Box::new(staged))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn temp_settings() -> (PathBuf, StorageSettings) {
        let root = std::env::temp_dir().join(format!("coordinator-store-{}", rand::random::<u64>()));
        let settings = StorageSettings {
            uploads_dir: root.join("uploads"),
            global_model_dir: root.join("global"),
            base_model_dir: root.join("base"),
            base_model_file: "base.ckpt".to_string(),
            client_data_file: root.join("data.txt"),
        };
        (root, settings)
    }

    #[tokio::test]
    async fn uploads_layout() {
        let (root, settings) = temp_settings();
        let store = FsStore::new(&settings);

        let mut model = store.stage_model("m1.ckpt").await.unwrap();
        model.append(b"wei").await.unwrap();
        model.append(b"ghts").await.unwrap();
        assert!(!root.join("uploads/m1.ckpt").exists());
        model.commit().await.unwrap();
        store.save_data_count("m1.ckpt", "10").await.unwrap();

        let model = std::fs::read(root.join("uploads/m1.ckpt")).unwrap();
        assert_eq!(model, b"weights");
        let count = std::fs::read_to_string(root.join("uploads/m1_data_count.txt")).unwrap();
        assert_eq!(count, "10");
        assert_eq!(std::fs::read_dir(root.join("uploads")).unwrap().count(), 2);

        store.discard_model("m1.ckpt").await.unwrap();
        assert!(!root.join("uploads/m1.ckpt").exists());
        // discarding twice is fine
        store.discard_model("m1.ckpt").await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn missing_files_are_none() {
        let (root, settings) = temp_settings();
        let store = FsStore::new(&settings);

        assert!(store.global_model("merged.ckpt").await.unwrap().is_none());
        assert!(store.asset(Asset::MinValues).await.unwrap().is_none());

        std::fs::create_dir_all(root.join("base")).unwrap();
        std::fs::write(root.join("base/max_vals.txt"), "1.0").unwrap();
        std::fs::write(root.join("base/base.ckpt"), "base").unwrap();
        assert_eq!(
            store.asset(Asset::MaxValues).await.unwrap().unwrap(),
            Bytes::from_static(b"1.0")
        );
        assert_eq!(
            store.asset(Asset::BaseModel).await.unwrap().unwrap(),
            Bytes::from_static(b"base")
        );

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn uncommitted_files_are_discarded() {
        let (root, settings) = temp_settings();
        let store = FsStore::new(&settings);

        let mut model = store.stage_model("m1.ckpt").await.unwrap();
        model.append(b"partial").await.unwrap();
        drop(model);
        assert_eq!(std::fs::read_dir(root.join("uploads")).unwrap().count(), 0);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn concurrent_client_data() {
        let (root, settings) = temp_settings();
        let store = Arc::new(FsStore::new(&settings));

        for _ in 0..20 {
            let writers = [b'a', b'b'].map(|byte| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut data = store.stage_client_data().await?;
                    for _ in 0..16 {
                        data.append(&[byte; 64 * 1024]).await?;
                    }
                    data.commit().await
                })
            });
            for writer in writers {
                writer.await.unwrap().unwrap();
            }

            // one of the writers wins, never a mix of both
            let data = std::fs::read(&settings.client_data_file).unwrap();
            assert_eq!(data.len(), 1 << 20);
            assert!(data.iter().all(|b| *b == data[0]));
        }
        // only the final file is left
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 1);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
