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

use futures::{stream::BoxStream, StreamExt as _};
use std::{io, path::Path};
use tempfile::NamedTempFile;
use tokio_util::{bytes::Bytes, io::ReaderStream};

pub type SegmentStream = BoxStream<'static, io::Result<Bytes>>;

/// Contents detached from an active target.
#[derive(Debug)]
pub enum Payload {
    Memory(Bytes),
    /// The temporary file is removed from disk when the payload is dropped.
    File(NamedTempFile),
}

/// An immutable chunk of buffered data destined for a single remote object.
#[derive(Debug)]
pub struct Segment {
    key: String,
    len: u64,
    payload: Payload,
}

impl Segment {
    pub fn new(key: String, len: u64, payload: Payload) -> Self {
        Self { key, len, payload }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing temporary file, if the segment was spilled to disk.
    pub fn spill_path(&self) -> Option<&Path> {
        match &self.payload {
            Payload::Memory(_) => None,
            Payload::File(file) => Some(file.path()),
        }
    }

    /// Read the whole segment into memory.
    pub async fn bytes(&self) -> io::Result<Bytes> {
        match &self.payload {
            Payload::Memory(data) => Ok(data.clone()),
            Payload::File(file) => tokio::fs::read(file.path()).await.map(Bytes::from),
        }
    }

    /// Open an independent reader over the segment.
    ///
    /// Every call starts from the beginning, so a failed upload can simply ask
    /// for a new stream.
    pub fn stream(&self) -> io::Result<SegmentStream> {
        match &self.payload {
            Payload::Memory(data) => {
                let data = data.clone();
                Ok(futures::stream::once(async move { Ok(data) }).boxed())
            }
            Payload::File(file) => {
                let file = tokio::fs::File::from_std(file.reopen()?);
                Ok(ReaderStream::new(file).boxed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt as _;
    use std::io::Write as _;
    use tempfile::TempDir;

    async fn collect(segment: &Segment) -> Vec<u8> {
        segment
            .stream()
            .unwrap()
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn memory_segment_can_be_read_twice() {
        let segment = Segment::new(
            "logs/a".to_string(),
            5,
            Payload::Memory(Bytes::from_static(b"hello")),
        );

        assert_eq!(segment.key(), "logs/a");
        assert!(segment.spill_path().is_none());
        assert_eq!(collect(&segment).await, b"hello");
        assert_eq!(collect(&segment).await, b"hello");
        assert_eq!(segment.bytes().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn file_segment_is_removed_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = NamedTempFile::new_in(temp_dir.path()).unwrap();
        file.write_all(b"spilled").unwrap();

        let segment = Segment::new("logs/b".to_string(), 7, Payload::File(file));
        let path = segment.spill_path().unwrap().to_path_buf();

        assert_eq!(collect(&segment).await, b"spilled");
        assert_eq!(segment.bytes().await.unwrap(), "spilled");
        assert!(path.exists());

        drop(segment);
        assert!(!path.exists());
    }
}
