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

mod args;

use anyhow::Context as _;
use blob_buffer::{Buffer, HttpUploader, UploadPool};
use clap::Parser as _;
use std::{io::BufRead as _, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config().await?;
    let uploader = Arc::new(HttpUploader::from_config(&config.uploader)?);

    let (dispatcher, mut pool) = UploadPool::spawn(
        uploader,
        &config.buffer.bucket,
        config.buffer.max_concurrent_uploads,
    );
    let mut buffer = Buffer::new(&config.buffer, dispatcher)?;

    // Handle ctrl-c
    let token = CancellationToken::new();
    tokio::task::spawn({
        let token = token.clone();
        async move {
            _ = tokio::signal::ctrl_c().await;
            token.cancel();
        }
    });

    // A segment that could not be uploaded is fatal: stop reading input.
    let mut failures = pool.take_failures();
    let failure_watch = tokio::task::spawn({
        let token = token.clone();
        async move {
            let mut failed = 0u64;
            while let Some(failure) = failures.recv().await {
                tracing::error!(
                    "giving up on {} ({} bytes): {}",
                    failure.segment.key(),
                    failure.segment.len(),
                    failure.error
                );
                failed += 1;
                token.cancel();
            }
            failed
        }
    });

    // Reads from stdin cannot be cancelled, so they happen on a plain thread
    // that is left behind on shutdown instead of blocking the runtime.
    let (line_sender, mut lines) = mpsc::channel(1024);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line_sender.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let mut input_error = None;
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.recv() => line,
        };
        let result = match line {
            Some(Ok(line)) => buffer
                .write_line(&line)
                .map(|_| ())
                .map_err(anyhow::Error::from),
            Some(Err(err)) => Err(anyhow::Error::from(err).context("Failed to read standard input")),
            None => break,
        };
        if let Err(err) = result {
            tracing::error!("{err:#}");
            input_error = Some(err);
            break;
        }
    }

    let flushes = buffer.flushes();
    match buffer.close() {
        Ok(Some(key)) => tracing::info!("flushed remaining input as {key}"),
        Ok(None) => {}
        Err(err) => {
            tracing::error!("{err}");
            input_error.get_or_insert(err.into());
        }
    }

    let summary = pool.join().await.context("Upload pool panicked")?;
    let failed = failure_watch.await.context("Failure watcher panicked")?;
    tracing::info!(
        "{} segments uploaded ({} bytes), {} failed, {} flushed at threshold",
        summary.uploaded,
        summary.bytes,
        summary.failed,
        flushes
    );

    if let Some(err) = input_error {
        return Err(err);
    }
    if failed > 0 {
        anyhow::bail!("{failed} segments could not be uploaded");
    }

    Ok(())
}
