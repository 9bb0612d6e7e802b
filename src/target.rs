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

use std::io::{self, BufWriter, Write as _};
use tempfile::NamedTempFile;
use tokio_util::bytes::Bytes;

use crate::{config::StorageConfig, segment::Payload};

/// Sink that receives appended bytes until the next flush.
/// Allows different strategies for holding the data (memory vs temporary file).
pub trait Target: Send {
    /// Append `data` to the target.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Exact number of bytes held by the target.
    ///
    /// Implementations must account for every byte passed to `append`, even
    /// if it is still sitting in an internal write buffer.
    fn size(&mut self) -> io::Result<u64>;

    /// Give up the accumulated data for upload.
    fn detach(self: Box<Self>) -> io::Result<Payload>;
}

impl StorageConfig {
    /// Create an empty target with `header` already written to it.
    pub fn create_target(&self, header: &[u8]) -> io::Result<Box<dyn Target>> {
        let mut target: Box<dyn Target> = match self {
            StorageConfig::Memory => Box::new(MemoryTarget::default()),
            StorageConfig::File { directory } => {
                let file = match directory {
                    Some(directory) => NamedTempFile::new_in(directory)?,
                    None => NamedTempFile::new()?,
                };
                Box::new(FileTarget::new(file))
            }
        };
        if !header.is_empty() {
            target.append(header)?;
        }
        Ok(target)
    }
}

#[derive(Debug, Default)]
pub struct MemoryTarget {
    data: Vec<u8>,
}

impl Target for MemoryTarget {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn detach(self: Box<Self>) -> io::Result<Payload> {
        Ok(Payload::Memory(Bytes::from(self.data)))
    }
}

#[derive(Debug)]
pub struct FileTarget {
    writer: BufWriter<NamedTempFile>,
}

impl FileTarget {
    pub fn new(file: NamedTempFile) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }
}

impl Target for FileTarget {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)
    }

    fn size(&mut self) -> io::Result<u64> {
        // Metadata only sees what reached the file.
        self.writer.flush()?;
        Ok(self.writer.get_ref().as_file().metadata()?.len())
    }

    fn detach(self: Box<Self>) -> io::Result<Payload> {
        let file = self.writer.into_inner().map_err(|err| err.into_error())?;
        file.as_file().sync_all()?;
        Ok(Payload::File(file))
    }
}
