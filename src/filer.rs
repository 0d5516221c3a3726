//! File Translator
//!
//! Turns file-level byte ranges into batches of per-object operations on an
//! [`ObjectBackend`] and folds the results back into one answer.
//!
//! ```text
//! write(file, off, buf)
//!   └─ file_to_extents ─▶ [obj 2: 3808+288] [obj 3: 0+4096] [obj 0: 4096+4096] ...
//!        └─ one backend call per object extent, all in flight at once
//!             └─ join ─▶ first error in extent order, or Ok
//! ```
//!
//! Multi-object operations are not atomic: when one sub-request fails the
//! others may already have taken effect.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::backend::ObjectBackend;
use crate::error::Result;
use crate::striper::{assemble, file_to_extents, object_name, StripeLayout};
use crate::types::{Durability, ObjectLocator, PolicyId};

/// A striped file: inode number, layout, placement policy and current size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    pub ino: u64,
    pub layout: StripeLayout,
    pub policy: PolicyId,
    pub size: u64,
}

impl FileHandle {
    pub fn new(ino: u64, layout: StripeLayout, policy: PolicyId) -> Result<Self> {
        layout.validate()?;
        Ok(Self {
            ino,
            layout,
            policy,
            size: 0,
        })
    }

    /// Object name prefix: the inode number in hex.
    pub fn prefix(&self) -> String {
        format!("{:x}", self.ino)
    }

    pub fn locator(&self, object_no: u64) -> ObjectLocator {
        ObjectLocator::new(object_name(&self.prefix(), object_no), self.policy)
    }

    /// Number of backing objects holding `[0, size)`.
    pub fn object_count(&self) -> u64 {
        let l = &self.layout;
        let set_size = l.object_set_size();
        let full_sets = self.size / set_size;
        let rest = self.size % set_size;
        let partial = rest.div_ceil(l.stripe_unit).min(l.stripe_count);
        full_sets * l.stripe_count + partial
    }
}

/// File-level operations over an object backend
pub struct Filer {
    backend: Arc<dyn ObjectBackend>,
    durability: Durability,
}

impl Filer {
    pub fn new(backend: Arc<dyn ObjectBackend>, durability: Durability) -> Self {
        Self {
            backend,
            durability,
        }
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// Read `[offset, offset + length)`. Holes and bytes past the end of an
    /// object read as zeros.
    #[instrument(skip(self, file), fields(ino = file.ino))]
    pub async fn read(&self, file: &FileHandle, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let extents = file_to_extents(&file.prefix(), &file.layout, offset, length)?;
        debug!(objects = extents.len(), "read fan-out");

        let reads = extents.iter().map(|ex| {
            let locator = ObjectLocator::new(ex.oid.clone(), file.policy);
            let backend = Arc::clone(&self.backend);
            async move { backend.read(&locator, ex.offset, ex.length).await }
        });
        let results = join_all(reads).await;

        let mut parts = Vec::with_capacity(extents.len());
        for (ex, result) in extents.iter().zip(results) {
            let data = result?;
            for (buffer_offset, piece) in ex.scatter(&data) {
                parts.push((offset + buffer_offset, piece));
            }
        }
        assemble(offset, length, parts)
    }

    /// Write at the filer's default durability and grow the file if needed.
    pub async fn write(&self, file: &mut FileHandle, offset: u64, data: Bytes) -> Result<()> {
        self.write_with(file, offset, data, self.durability).await
    }

    #[instrument(skip(self, file, data), fields(ino = file.ino, length = data.len()))]
    pub async fn write_with(
        &self,
        file: &mut FileHandle,
        offset: u64,
        data: Bytes,
        durability: Durability,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let length = data.len() as u64;
        let extents = file_to_extents(&file.prefix(), &file.layout, offset, length)?;
        debug!(objects = extents.len(), ?durability, "write fan-out");

        let writes = extents.iter().map(|ex| {
            let locator = ObjectLocator::new(ex.oid.clone(), file.policy);
            let payload = ex.gather(&data);
            let backend = Arc::clone(&self.backend);
            async move {
                backend
                    .write(&locator, ex.offset, payload, durability)
                    .await
            }
        });
        for result in join_all(writes).await {
            result?;
        }

        file.size = file.size.max(offset + length);
        Ok(())
    }

    /// Set the file size. Shrinking truncates every object holding data at
    /// or past `new_size`; growing only changes the recorded size.
    #[instrument(skip(self, file), fields(ino = file.ino, old_size = file.size))]
    pub async fn truncate(&self, file: &mut FileHandle, new_size: u64) -> Result<()> {
        if new_size < file.size {
            let extents =
                file_to_extents(&file.prefix(), &file.layout, new_size, file.size - new_size)?;

            // First appearance of an object is its lowest touched offset
            let mut seen = std::collections::HashSet::new();
            let cuts: Vec<(ObjectLocator, u64)> = extents
                .iter()
                .filter(|ex| seen.insert(ex.object_no))
                .map(|ex| (ObjectLocator::new(ex.oid.clone(), file.policy), ex.offset))
                .collect();
            debug!(objects = cuts.len(), "truncate fan-out");

            let ops = cuts.iter().map(|(locator, at)| {
                let backend = Arc::clone(&self.backend);
                async move { backend.truncate(locator, *at).await }
            });
            for result in join_all(ops).await {
                result?;
            }
        }
        file.size = new_size;
        Ok(())
    }

    /// Zero `[offset, offset + length)` without changing the file size.
    #[instrument(skip(self, file), fields(ino = file.ino))]
    pub async fn zero_fill(&self, file: &FileHandle, offset: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let extents = file_to_extents(&file.prefix(), &file.layout, offset, length)?;
        let ops = extents.iter().map(|ex| {
            let locator = ObjectLocator::new(ex.oid.clone(), file.policy);
            let backend = Arc::clone(&self.backend);
            async move { backend.zero(&locator, ex.offset, ex.length).await }
        });
        for result in join_all(ops).await {
            result?;
        }
        Ok(())
    }

    /// Remove objects `first..first + count` of a file.
    #[instrument(skip(self, file), fields(ino = file.ino))]
    pub async fn purge_objects(&self, file: &FileHandle, first: u64, count: u64) -> Result<()> {
        let ops = (first..first.saturating_add(count)).map(|no| {
            let locator = file.locator(no);
            let backend = Arc::clone(&self.backend);
            async move { backend.remove(&locator).await }
        });
        for result in join_all(ops).await {
            result?;
        }
        Ok(())
    }

    /// Remove every object of the file and reset its size.
    pub async fn remove(&self, file: &mut FileHandle) -> Result<()> {
        self.purge_objects(file, 0, file.object_count()).await?;
        file.size = 0;
        Ok(())
    }
}
