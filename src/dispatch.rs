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

use futures::StreamExt as _;
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::{JoinError, JoinHandle},
};

use crate::{
    segment::Segment,
    uploader::{UploadError, Uploader},
};

/// A segment whose upload failed for good, handed back to the host.
///
/// Dropping it releases the segment (and its temporary file, if any).
#[derive(Debug)]
pub struct UploadFailure {
    pub segment: Segment,
    pub error: UploadError,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: u64,
    pub failed: u64,
    pub bytes: u64,
}

/// Sending half of the upload queue, owned by a buffer.
///
/// Submitting never waits: the queue is unbounded.
#[derive(Debug)]
pub struct Dispatcher {
    sender: UnboundedSender<Segment>,
}

impl Dispatcher {
    /// Queue a segment. Gives it back if the pool is gone.
    pub fn submit(&self, segment: Segment) -> Result<(), Segment> {
        self.sender.send(segment).map_err(|err| err.0)
    }

    #[cfg(test)]
    pub(crate) fn channel() -> (Self, UnboundedReceiver<Segment>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

/// Background task uploading queued segments with bounded concurrency.
pub struct UploadPool {
    task: JoinHandle<UploadSummary>,
    failures: UnboundedReceiver<UploadFailure>,
}

impl UploadPool {
    /// Start the pool on the current tokio runtime.
    ///
    /// The pool runs until every [`Dispatcher`] is dropped and the queue is
    /// drained; at most `max_concurrent_uploads` uploads run at once.
    pub fn spawn(
        uploader: Arc<dyn Uploader>,
        bucket: impl Into<String>,
        max_concurrent_uploads: usize,
    ) -> (Dispatcher, UploadPool) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (failure_sender, failures) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            uploader,
            bucket.into(),
            max_concurrent_uploads.max(1),
            receiver,
            failure_sender,
        ));
        (Dispatcher { sender }, UploadPool { task, failures })
    }

    /// Wait for the next failed segment.
    ///
    /// Returns `None` once the pool has finished.
    pub async fn next_failure(&mut self) -> Option<UploadFailure> {
        self.failures.recv().await
    }

    /// Split off the failure channel, e.g. to watch it from another task.
    pub fn take_failures(&mut self) -> UnboundedReceiver<UploadFailure> {
        let (_, closed) = mpsc::unbounded_channel();
        std::mem::replace(&mut self.failures, closed)
    }

    /// Wait for the queue to drain after all dispatchers are dropped.
    pub async fn join(self) -> Result<UploadSummary, JoinError> {
        self.task.await
    }
}

async fn run(
    uploader: Arc<dyn Uploader>,
    bucket: String,
    max_concurrent_uploads: usize,
    receiver: UnboundedReceiver<Segment>,
    failures: UnboundedSender<UploadFailure>,
) -> UploadSummary {
    let queue = futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|segment| (segment, receiver))
    });

    queue
        .map(|segment| {
            let uploader = uploader.clone();
            let bucket = bucket.clone();
            async move {
                let result = uploader.upload(&bucket, &segment).await;
                (segment, result)
            }
        })
        .buffer_unordered(max_concurrent_uploads)
        .fold(UploadSummary::default(), |mut summary, (segment, result)| {
            match result {
                Ok(()) => {
                    tracing::debug!("uploaded {} ({} bytes)", segment.key(), segment.len());
                    summary.uploaded += 1;
                    summary.bytes += segment.len();
                }
                Err(error) => {
                    tracing::error!("{error}");
                    summary.failed += 1;
                    if let Err(failure) = failures.send(UploadFailure { segment, error }) {
                        tracing::error!(
                            "segment {} lost: nobody is listening for upload failures",
                            failure.0.segment.key()
                        );
                    }
                }
            }
            futures::future::ready(summary)
        })
        .await
}
