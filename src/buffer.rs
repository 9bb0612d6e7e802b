// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::io;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::{BufferConfig, ConfigError, StorageConfig},
    dispatch::Dispatcher,
    segment::Segment,
    target::Target,
};

#[derive(Error, Debug)]
pub enum BufferError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("write to {name} buffer failed: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("size query on {name} buffer failed: {source}")]
    Size {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("creating a new target for {name} buffer failed: {source}")]
    Reset {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("detaching segment {key} failed: {source}")]
    Detach {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("upload pool is gone, segment {key} was not queued")]
    Closed { key: String },
}

/// Generate the destination key for a new segment.
pub fn segment_key(name: &str) -> String {
    format!("{name}/{}", Uuid::new_v4())
}

/// Accumulates writes and hands them off as segments once `max_size` is hit.
///
/// A buffer has a single writer; flushing swaps in a fresh target before the
/// full one is queued for upload, so a write never waits for the network.
pub struct Buffer {
    name: String,
    max_size: u64,
    header: Vec<u8>,
    storage: StorageConfig,
    target: Box<dyn Target>,
    dispatcher: Dispatcher,
    flushes: u64,
    flush_error: Option<BufferError>,
}

impl Buffer {
    pub fn new(config: &BufferConfig, dispatcher: Dispatcher) -> Result<Self, BufferError> {
        config.validate()?;

        let header = config.header.as_bytes().to_vec();
        let target = config
            .storage
            .create_target(&header)
            .map_err(|source| BufferError::Reset {
                name: config.name.clone(),
                source,
            })?;

        Ok(Self::with_target(config, header, target, dispatcher))
    }

    fn with_target(
        config: &BufferConfig,
        header: Vec<u8>,
        target: Box<dyn Target>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            name: config.name.clone(),
            max_size: config.max_size,
            header,
            storage: config.storage.clone(),
            target,
            dispatcher,
            flushes: 0,
            flush_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of segments handed off so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Append `data` to the active target.
    ///
    /// An `Err` means nothing was appended. Once the bytes are in, the write
    /// succeeds even if the flush it triggered fails; that failure is kept
    /// and returned by the next write, [`Buffer::take_flush_error`] or
    /// [`Buffer::close`].
    pub fn write(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        self.append(&[data])
    }

    pub fn write_line(&mut self, line: &str) -> Result<usize, BufferError> {
        self.append(&[line.as_bytes(), b"\n"])
    }

    fn append(&mut self, parts: &[&[u8]]) -> Result<usize, BufferError> {
        if let Some(err) = self.flush_error.take() {
            return Err(err);
        }

        let mut written = 0;
        for part in parts {
            self.target
                .append(part)
                .map_err(|source| BufferError::Write {
                    name: self.name.clone(),
                    source,
                })?;
            written += part.len();
        }

        if let Err(err) = self.check_flush() {
            tracing::error!("{err}");
            self.flush_error = Some(err);
        }
        Ok(written)
    }

    /// Failure of the last flush triggered by a write, if not reported yet.
    pub fn take_flush_error(&mut self) -> Option<BufferError> {
        self.flush_error.take()
    }

    pub fn current_size(&mut self) -> Result<u64, BufferError> {
        self.target.size().map_err(|source| BufferError::Size {
            name: self.name.clone(),
            source,
        })
    }

    pub fn should_flush(&mut self) -> Result<bool, BufferError> {
        Ok(self.current_size()? >= self.max_size)
    }

    /// Flush if the threshold was reached. Returns whether a flush happened.
    pub fn check_flush(&mut self) -> Result<bool, BufferError> {
        if !self.should_flush()? {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Detach the active target and queue it for upload, whatever its size.
    ///
    /// On return the buffer holds a fresh target containing only the header.
    /// Returns the key the segment will be stored under.
    pub fn flush(&mut self) -> Result<String, BufferError> {
        let key = segment_key(&self.name);
        let len = self.current_size()?;

        let full = self.reset()?;
        let payload = full.detach().map_err(|source| BufferError::Detach {
            key: key.clone(),
            source,
        })?;
        self.flushes += 1;

        tracing::debug!("flushing {len} bytes from {} buffer as {key}", self.name);
        self.dispatcher
            .submit(Segment::new(key.clone(), len, payload))
            .map_err(|segment| BufferError::Closed {
                key: segment.key().to_string(),
            })?;

        Ok(key)
    }

    /// Install a new target with the header and return the previous one.
    fn reset(&mut self) -> Result<Box<dyn Target>, BufferError> {
        let fresh = self
            .storage
            .create_target(&self.header)
            .map_err(|source| BufferError::Reset {
                name: self.name.clone(),
                source,
            })?;
        Ok(std::mem::replace(&mut self.target, fresh))
    }

    /// Flush whatever was written since the last reset and release the
    /// dispatcher, letting the upload pool finish.
    ///
    /// A flush failure still pending from an earlier write is returned even
    /// if the final flush succeeds.
    pub fn close(mut self) -> Result<Option<String>, BufferError> {
        let pending = self.flush_error.take();
        let key = if self.current_size()? > self.header.len() as u64 {
            Some(self.flush()?)
        } else {
            None
        };
        match pending {
            Some(err) => Err(err),
            None => Ok(key),
        }
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Buffer::write(self, buf).map_err(|err| match err {
            BufferError::Write { source, .. } | BufferError::Size { source, .. } => source,
            err => io::Error::other(err),
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        // Segments are cut by size only.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatch::UploadPool,
        target::testing::FaultyTarget,
        uploader::testing::{FailingUploader, GatedUploader, RecordingUploader},
    };
    use std::{
        collections::HashSet,
        io::Write as _,
        sync::{atomic::Ordering, Arc},
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn create_test_config(max_size: u64, header: &str) -> BufferConfig {
        let mut config = BufferConfig::new("app", "logs");
        config.max_size = max_size;
        config.header = header.to_string();
        config
    }

    fn create_test_buffer(config: &BufferConfig) -> (Buffer, UnboundedReceiver<Segment>) {
        let (dispatcher, receiver) = Dispatcher::channel();
        (Buffer::new(config, dispatcher).unwrap(), receiver)
    }

    #[test]
    fn below_threshold_never_flushes() {
        let (mut buffer, mut receiver) = create_test_buffer(&create_test_config(100, ""));

        let mut total = 0;
        for span in [&b"abc"[..], b"", b"defgh", b"ij"] {
            assert_eq!(buffer.write(span).unwrap(), span.len());
            total += span.len() as u64;
            assert_eq!(buffer.current_size().unwrap(), total);
        }

        assert!(!buffer.should_flush().unwrap());
        assert_eq!(buffer.flushes(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn header_counts_towards_size() {
        let (mut buffer, mut receiver) = create_test_buffer(&create_test_config(100, "H:"));

        buffer.write(&[b'x'; 50]).unwrap();

        assert_eq!(buffer.current_size().unwrap(), 52);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn crossing_threshold_flushes_once_and_resets() {
        let (mut buffer, mut receiver) = create_test_buffer(&create_test_config(10, ""));

        buffer.write(b"hello").unwrap();
        assert_eq!(buffer.current_size().unwrap(), 5);
        buffer.write(b"world!").unwrap();
        assert_eq!(buffer.current_size().unwrap(), 0);
        assert_eq!(buffer.flushes(), 1);

        let segment = receiver.try_recv().unwrap();
        assert_eq!(segment.len(), 11);
        assert_eq!(segment.bytes().await.unwrap(), "helloworld!");
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn reset_writes_header_into_new_target() {
        let (mut buffer, mut receiver) = create_test_buffer(&create_test_config(8, "H:"));

        buffer.write_line("abcdef").unwrap();

        assert_eq!(buffer.current_size().unwrap(), 2);
        let segment = receiver.try_recv().unwrap();
        assert_eq!(segment.bytes().await.unwrap(), "H:abcdef\n");
    }

    #[tokio::test]
    async fn oversized_write_flushes_immediately() {
        let (mut buffer, mut receiver) = create_test_buffer(&create_test_config(4, ""));

        assert_eq!(buffer.write(b"0123456789").unwrap(), 10);

        assert_eq!(buffer.current_size().unwrap(), 0);
        let segment = receiver.try_recv().unwrap();
        assert_eq!(segment.bytes().await.unwrap(), "0123456789");
    }

    #[test]
    fn keys_are_unique_across_flushes() {
        let (mut buffer, mut receiver) = create_test_buffer(&create_test_config(1, ""));

        for _ in 0..10_000 {
            buffer.write(b"x").unwrap();
        }

        let mut keys = HashSet::new();
        while let Ok(segment) = receiver.try_recv() {
            assert!(segment.key().starts_with("app/"));
            keys.insert(segment.key().to_string());
        }
        assert_eq!(buffer.flushes(), 10_000);
        assert_eq!(keys.len(), 10_000);
    }

    #[test]
    fn segment_key_has_name_prefix() {
        let key = segment_key("service/logs");
        let suffix = key.strip_prefix("service/logs/").unwrap();
        assert!(Uuid::parse_str(suffix).is_ok());
    }

    #[tokio::test]
    async fn every_flush_is_uploaded_with_exact_payload() {
        let uploader = Arc::new(RecordingUploader::default());
        let config = create_test_config(6, "#");
        let (dispatcher, pool) = UploadPool::spawn(uploader.clone(), &config.bucket, 1);
        let mut buffer = Buffer::new(&config, dispatcher).unwrap();

        for line in ["a", "bb", "ccc", "dddd", "e"] {
            buffer.write_line(line).unwrap();
        }
        assert_eq!(buffer.flushes(), 2);
        assert_eq!(buffer.close().unwrap().map(|key| key.starts_with("app/")), Some(true));

        let summary = pool.join().await.unwrap();
        assert_eq!(summary.uploaded, 3);
        assert_eq!(
            uploader.payloads(),
            ["#a\nbb\n", "#ccc\ndddd\n", "#e\n"]
        );
    }

    #[tokio::test]
    async fn close_without_data_does_not_flush() {
        let uploader = Arc::new(RecordingUploader::default());
        let config = create_test_config(100, "H:");
        let (dispatcher, pool) = UploadPool::spawn(uploader.clone(), &config.bucket, 1);
        let buffer = Buffer::new(&config, dispatcher).unwrap();

        assert!(buffer.close().unwrap().is_none());
        assert_eq!(pool.join().await.unwrap().uploaded, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_returns_before_upload_completes() {
        let uploader = Arc::new(GatedUploader::new());
        let config = create_test_config(10, "");
        let (dispatcher, pool) = UploadPool::spawn(uploader.clone(), &config.bucket, 1);
        let mut buffer = Buffer::new(&config, dispatcher).unwrap();

        buffer.write(b"0123456789").unwrap();
        buffer.write(b"abc").unwrap();

        while uploader.started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(uploader.completed.load(Ordering::SeqCst), 0);
        assert_eq!(buffer.current_size().unwrap(), 3);

        uploader.gate.add_permits(2);
        buffer.close().unwrap();
        let summary = pool.join().await.unwrap();
        assert_eq!(summary.uploaded, 2);
        assert_eq!(uploader.completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_upload_is_surfaced() {
        let uploader = Arc::new(FailingUploader::default());
        let config = create_test_config(5, "");
        let (dispatcher, mut pool) = UploadPool::spawn(uploader.clone(), &config.bucket, 1);
        let mut buffer = Buffer::new(&config, dispatcher).unwrap();

        buffer.write(b"doomed").unwrap();
        assert_eq!(buffer.flushes(), 1);
        drop(buffer);

        let failure = pool.next_failure().await.unwrap();
        assert!(failure.segment.key().starts_with("app/"));
        assert_eq!(failure.segment.bytes().await.unwrap(), "doomed");
        assert_eq!(pool.join().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn flush_without_pool_is_reported_after_write() {
        let (mut buffer, receiver) = create_test_buffer(&create_test_config(3, ""));
        drop(receiver);

        // The bytes were accepted, so the write itself succeeds.
        assert_eq!(io::Write::write(&mut buffer, b"abcd").unwrap(), 4);
        // The new target is already installed.
        assert_eq!(buffer.current_size().unwrap(), 0);

        let err = buffer.write(b"ef").unwrap_err();
        assert!(matches!(err, BufferError::Closed { .. }));
        assert_eq!(buffer.current_size().unwrap(), 0);
        assert!(buffer.take_flush_error().is_none());
    }

    #[tokio::test]
    async fn failed_reset_does_not_duplicate_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let spill = temp_dir.path().join("spill");
        let moved = temp_dir.path().join("moved");
        std::fs::create_dir(&spill).unwrap();
        let mut config = create_test_config(5, "");
        config.storage = StorageConfig::File {
            directory: Some(spill.clone()),
        };
        let (mut buffer, mut receiver) = create_test_buffer(&config);

        // New targets cannot be created while the directory is gone.
        std::fs::rename(&spill, &moved).unwrap();
        assert_eq!(buffer.write(b"abcdef").unwrap(), 6);
        assert_eq!(buffer.current_size().unwrap(), 6);

        let err = buffer.write(b"abcdef").unwrap_err();
        assert!(matches!(err, BufferError::Reset { .. }));
        assert_eq!(buffer.current_size().unwrap(), 6);
        assert!(receiver.try_recv().is_err());

        std::fs::rename(&moved, &spill).unwrap();
        buffer.write(b"g").unwrap();
        assert_eq!(buffer.current_size().unwrap(), 0);

        let segment = receiver.try_recv().unwrap();
        assert_eq!(segment.bytes().await.unwrap(), "abcdefg");
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn append_failure_is_returned_as_write_error() {
        let config = create_test_config(1, "");
        let (dispatcher, mut receiver) = Dispatcher::channel();
        let target = FaultyTarget {
            fail_append: true,
            ..Default::default()
        };
        let mut buffer = Buffer::with_target(&config, Vec::new(), Box::new(target), dispatcher);

        let err = buffer.write(b"abc").unwrap_err();
        assert!(matches!(err, BufferError::Write { .. }));
        assert!(err.to_string().contains("disk full"));
        assert!(matches!(
            buffer.write_line("abc"),
            Err(BufferError::Write { .. })
        ));

        let err = io::Write::write(&mut buffer, b"abc").unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(buffer.flushes(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn size_failure_is_returned_as_size_error() {
        let config = create_test_config(1, "");
        let (dispatcher, mut receiver) = Dispatcher::channel();
        let target = FaultyTarget {
            fail_size: true,
            ..Default::default()
        };
        let mut buffer = Buffer::with_target(&config, Vec::new(), Box::new(target), dispatcher);

        assert!(matches!(
            buffer.current_size(),
            Err(BufferError::Size { .. })
        ));
        assert!(matches!(
            buffer.should_flush(),
            Err(BufferError::Size { .. })
        ));

        // The append went through; the flush decision could not be made.
        assert_eq!(buffer.write(b"abc").unwrap(), 3);
        assert!(matches!(
            buffer.take_flush_error(),
            Some(BufferError::Size { .. })
        ));
        assert_eq!(buffer.flushes(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn close_reports_pending_flush_error() {
        let (mut buffer, receiver) = create_test_buffer(&create_test_config(3, ""));
        drop(receiver);

        buffer.write(b"abcd").unwrap();
        assert!(matches!(buffer.close(), Err(BufferError::Closed { .. })));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (dispatcher, _receiver) = Dispatcher::channel();
        let result = Buffer::new(&create_test_config(0, ""), dispatcher);
        assert!(matches!(result, Err(BufferError::Config(_))));
    }

    #[test]
    fn io_write_adapter() {
        let (mut buffer, _receiver) = create_test_buffer(&create_test_config(100, ""));

        writeln!(buffer, "{}={}", "level", "info").unwrap();
        assert_eq!(buffer.current_size().unwrap(), 11);
    }

    #[tokio::test]
    async fn file_storage_flushes_and_removes_spill_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(10, "H:");
        config.storage = StorageConfig::File {
            directory: Some(temp_dir.path().to_path_buf()),
        };
        let (mut buffer, mut receiver) = create_test_buffer(&config);

        buffer.write(b"abc").unwrap();
        assert_eq!(buffer.current_size().unwrap(), 5);
        buffer.write(b"defgh").unwrap();
        assert_eq!(buffer.current_size().unwrap(), 2);

        let segment = receiver.try_recv().unwrap();
        let path = segment.spill_path().unwrap().to_path_buf();
        assert!(path.starts_with(temp_dir.path()));
        assert_eq!(segment.bytes().await.unwrap(), "H:abcdefgh");

        drop(segment);
        assert!(!path.exists());
        // Only the active target's file is left.
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }
}
