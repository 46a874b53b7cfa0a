//! Persistence contract shared with the aggregation process.
//!
//! The coordinator only ever stores uploaded models (plus their data counts) and loads
//! the global model named by the aggregator and the static bootstrap assets.

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;

mod fs;
mod memory;

pub use self::{fs::FsStore, memory::MemoryStore};

/// The error type for storage operations. These are I/O failures that are not related to
/// the protocol itself.
pub type StorageError = anyhow::Error;

/// The result of a storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// Static files served to clients on request.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    #[display(fmt = "base model")]
    BaseModel,
    #[display(fmt = "min values")]
    MinValues,
    #[display(fmt = "max values")]
    MaxValues,
}

#[async_trait]
/// A file being written. Nothing is visible under the final name before
/// [`commit`](StagedFile::commit); dropping an uncommitted file discards what was written.
pub trait StagedFile: Send {
    /// Appends `chunk` to the file.
    async fn append(&mut self, chunk: &[u8]) -> StorageResult<()>;

    /// Moves the file under its final name, replacing any previous file with that name.
    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

#[async_trait]
/// An abstract coordinator storage.
pub trait Store
where
    Self: Send + Sync + 'static,
{
    /// Starts writing an uploaded model that will be stored under `name`.
    async fn stage_model(&self, name: &str) -> StorageResult<Box<dyn StagedFile>>;

    /// Stores the data count announced with the model `name`, see [`data_count_name`].
    async fn save_data_count(&self, name: &str, count: &str) -> StorageResult<()>;

    /// Removes the model `name`. Removing a model that does not exist is not an error.
    async fn discard_model(&self, name: &str) -> StorageResult<()>;

    /// Returns the global model `name` produced by the aggregator.
    ///
    /// # Behavior
    ///
    /// - If the model does not exist, return `StorageResult::Ok(Option::None)`.
    async fn global_model(&self, name: &str) -> StorageResult<Option<Bytes>>;

    /// Returns a static asset, or `None` if it is not available.
    async fn asset(&self, asset: Asset) -> StorageResult<Option<Bytes>>;

    /// Starts writing the data of an `UPLOAD_DATA` request. Committing it replaces the
    /// previous data.
    async fn stage_client_data(&self) -> StorageResult<Box<dyn StagedFile>>;
}

/// Name of the file holding the data count of the model `name`: the model name up to its
/// last `.`, followed by `_data_count.txt`.
pub fn data_count_name(name: &str) -> String {
    let base = match name.rfind('.') {
        Some(pos) => &name[..pos],
        None => name,
    };
    format!("{}_data_count.txt", base)
}
