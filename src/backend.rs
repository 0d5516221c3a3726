//! Object I/O seam used by the file translator.
//!
//! Two implementations: [`Router`] sends every call straight to the cluster,
//! [`crate::cache::ObjectCache`] serves and buffers through the write-back
//! cache.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::router::{Operation, Router, SubmitOptions};
use crate::types::{Durability, ObjectLocator};

/// Byte-range object operations
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Read exactly `length` bytes at `offset`; bytes past the end of the
    /// object read as zeros.
    async fn read(&self, locator: &ObjectLocator, offset: u64, length: u64) -> Result<Bytes>;

    /// Write `data` at `offset`, complete at the requested durability.
    async fn write(
        &self,
        locator: &ObjectLocator,
        offset: u64,
        data: Bytes,
        durability: Durability,
    ) -> Result<()>;

    /// Zero a range. A missing object is left missing.
    async fn zero(&self, locator: &ObjectLocator, offset: u64, length: u64) -> Result<()>;

    /// Set the object size.
    async fn truncate(&self, locator: &ObjectLocator, size: u64) -> Result<()>;

    /// Delete the object. Deleting a missing object succeeds.
    async fn remove(&self, locator: &ObjectLocator) -> Result<()>;
}

/// Apply the short-read rule to a read reply.
///
/// A reply shorter than requested is only acceptable when it stopped at the
/// end of the object; the rest is then zero-filled.
pub fn fill_short_read(offset: u64, length: u64, data: Bytes, object_size: u64) -> Result<Bytes> {
    let got = data.len() as u64;
    if got == length {
        return Ok(data);
    }
    if got > length {
        return Err(Error::gap(
            offset,
            length,
            format!("backend returned {got} bytes for a {length} byte read"),
        ));
    }
    if offset + got < object_size {
        return Err(Error::gap(
            offset + got,
            length - got,
            format!("short read of {got} bytes inside an object of {object_size} bytes"),
        ));
    }
    let mut buf = BytesMut::with_capacity(length as usize);
    buf.extend_from_slice(&data);
    buf.resize(length as usize, 0);
    Ok(buf.freeze())
}

/// `length` zero bytes.
pub(crate) fn zeros(length: u64) -> Bytes {
    Bytes::from(vec![0u8; length as usize])
}

/// Treat "object does not exist" as success.
pub(crate) fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ObjectBackend for Router {
    async fn read(&self, locator: &ObjectLocator, offset: u64, length: u64) -> Result<Bytes> {
        let pending = self.submit(
            locator.clone(),
            Operation::Read { offset, length },
            SubmitOptions::default(),
        )?;
        match pending.await {
            Ok(reply) => fill_short_read(offset, length, reply.data, reply.object_size),
            Err(e) if e.is_not_found() => Ok(zeros(length)),
            Err(e) => Err(e),
        }
    }

    async fn write(
        &self,
        locator: &ObjectLocator,
        offset: u64,
        data: Bytes,
        durability: Durability,
    ) -> Result<()> {
        self.submit(
            locator.clone(),
            Operation::Write { offset, data },
            SubmitOptions::ordered(locator, durability),
        )?
        .await
        .map(|_| ())
    }

    async fn zero(&self, locator: &ObjectLocator, offset: u64, length: u64) -> Result<()> {
        let pending = self.submit(
            locator.clone(),
            Operation::Zero { offset, length },
            SubmitOptions::ordered(locator, Durability::Applied),
        )?;
        ignore_not_found(pending.await.map(|_| ()))
    }

    async fn truncate(&self, locator: &ObjectLocator, size: u64) -> Result<()> {
        self.submit(
            locator.clone(),
            Operation::Truncate { size },
            SubmitOptions::ordered(locator, Durability::Applied),
        )?
        .await
        .map(|_| ())
    }

    async fn remove(&self, locator: &ObjectLocator) -> Result<()> {
        let pending = self.submit(
            locator.clone(),
            Operation::Remove,
            SubmitOptions::ordered(locator, Durability::Applied),
        )?;
        ignore_not_found(pending.await.map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_full_read_passes_through() {
        let data = Bytes::from_static(b"abcd");
        assert_eq!(fill_short_read(0, 4, data.clone(), 100).unwrap(), data);
    }

    #[test]
    fn test_short_read_at_object_end_is_zero_filled() {
        let out = fill_short_read(6, 4, Bytes::from_static(b"xy"), 8).unwrap();
        assert_eq!(&out[..], b"xy\0\0");
    }

    #[test]
    fn test_read_entirely_past_end() {
        let out = fill_short_read(100, 3, Bytes::new(), 10).unwrap();
        assert_eq!(&out[..], b"\0\0\0");
    }

    #[test]
    fn test_short_read_inside_object_is_gap() {
        let err = fill_short_read(0, 8, Bytes::from_static(b"abc"), 100).unwrap_err();
        assert_matches!(err, Error::GapError { offset: 3, length: 5, .. });
    }

    #[test]
    fn test_overlong_read_is_gap() {
        assert_matches!(
            fill_short_read(0, 2, Bytes::from_static(b"abc"), 3),
            Err(Error::GapError { .. })
        );
    }
}
