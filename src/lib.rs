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

//! Coalesce many small writes into few large objects in a blob store.
//!
//! A [`Buffer`] accumulates bytes in memory or in a temporary file. Once it
//! holds `max_size` bytes it swaps in an empty target and queues the full one
//! as a [`Segment`] on an [`UploadPool`], which uploads it through an
//! [`Uploader`] in the background.

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod segment;
pub mod target;
pub mod uploader;

pub use buffer::{Buffer, BufferError};
pub use config::{BufferConfig, Config, ConfigError, StorageConfig, UploaderConfig};
pub use dispatch::{Dispatcher, UploadFailure, UploadPool, UploadSummary};
pub use segment::Segment;
pub use uploader::{HttpUploader, UploadError, Uploader};
