use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::records::WriteOp;
use crate::store::ImportStore;

pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Buffers prepared writes and flushes them in fixed-size chunks. Each
/// chunk is one grouped store call, so a failure mid-import leaves earlier
/// chunks written and drops the rows still buffered.
pub struct BatchWriter<'a, S: ImportStore + ?Sized> {
    store: &'a S,
    tenant_id: Uuid,
    chunk_size: usize,
    buffer: Vec<WriteOp>,
    imported: usize,
    chunks: usize,
}

impl<'a, S: ImportStore + ?Sized> BatchWriter<'a, S> {
    pub fn new(store: &'a S, tenant_id: Uuid, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            store,
            tenant_id,
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            imported: 0,
            chunks: 0,
        }
    }

    /// Rows durably written so far.
    pub fn imported(&self) -> usize {
        self.imported
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub async fn push(&mut self, op: WriteOp) -> Result<(), StoreError> {
        self.buffer.push(op);
        if self.buffer.len() >= self.chunk_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes one source row's operations immediately, bypassing the buffer.
    /// Counts as a single imported row.
    pub async fn write_row(&mut self, ops: &[WriteOp]) -> Result<(), StoreError> {
        self.store.write_batch(self.tenant_id, ops).await?;
        self.imported += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        self.store.write_batch(self.tenant_id, &pending).await?;
        self.imported += pending.len();
        self.chunks += 1;
        debug!(
            tenant_id = %self.tenant_id,
            rows = pending.len(),
            chunk = self.chunks,
            "flushed import chunk"
        );
        Ok(())
    }

    /// Flushes the final partial chunk and returns the imported total.
    pub async fn finish(&mut self) -> Result<usize, StoreError> {
        self.flush().await?;
        Ok(self.imported)
    }
}
