//! Cancellable content pump from a read stream into a document sink.

use crate::error::StoreError;
use crate::store::{ByteStream, DocumentSink};
use futures::StreamExt;
use std::io;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Why a pump did not commit.
#[derive(Debug)]
pub(crate) enum PumpError {
    /// The token was cancelled; the sink was aborted.
    Cancelled,
    /// The source or destination could not be opened.
    Open(StoreError),
    /// The source stream failed; the sink was aborted.
    Read(io::Error),
    /// The sink rejected a write or the commit.
    Write(StoreError),
}

impl std::fmt::Display for PumpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpError::Cancelled => f.write_str("cancelled"),
            PumpError::Open(e) => write!(f, "open failed: {e}"),
            PumpError::Read(e) => write!(f, "read failed: {e}"),
            PumpError::Write(e) => write!(f, "write failed: {e}"),
        }
    }
}

/// Copy `source` into `sink` in pieces of at most `chunk_size` bytes and
/// commit it. Cancellation is checked between pieces; on any failure the
/// sink is aborted so nothing becomes visible.
///
/// Returns the number of bytes committed.
pub(crate) async fn pump(
    mut source: ByteStream,
    mut sink: Box<dyn DocumentSink>,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, PumpError> {
    let mut total: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                sink.abort().await;
                return Err(PumpError::Cancelled);
            }
            next = source.next() => next,
        };
        let mut chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                sink.abort().await;
                return Err(PumpError::Read(e));
            }
        };
        while !chunk.is_empty() {
            if cancel.is_cancelled() {
                sink.abort().await;
                return Err(PumpError::Cancelled);
            }
            let piece = chunk.split_to(chunk.len().min(chunk_size));
            total += piece.len() as u64;
            if let Err(e) = sink.write(piece).await {
                sink.abort().await;
                return Err(PumpError::Write(e));
            }
        }
        trace!(total, "Pumped chunk");
    }
    sink.commit().await.map_err(PumpError::Write)?;
    Ok(total)
}
