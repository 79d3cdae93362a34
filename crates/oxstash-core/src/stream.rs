//! Byte streams flowing in and out of storage backends.
//!
//! Readers hand back a [`ByteStream`]. Writers accept a [`ByteSource`], which
//! unifies the two ways callers produce data:
//!
//! - **pull**: an in-memory buffer, an iterator of chunks, or any `Stream`
//!   the writer polls at its own pace;
//! - **push**: a [`ByteSink`] obtained from [`ByteSource::channel`], where a
//!   producer task sends chunks and the writer consumes them as they arrive.
//!
//! Both end up as the same boxed stream, so backends and the cipher pipeline
//! only deal with one shape.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::error::StorageError;

/// A stream of byte chunks, failing with [`StorageError`].
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// Input for a write: a pull- or push-style sequence of byte chunks.
pub struct ByteSource {
    stream: ByteStream,
}

impl ByteSource {
    pub fn empty() -> Self {
        Self {
            stream: stream::empty().boxed(),
        }
    }

    /// A single in-memory chunk.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        Self {
            stream: stream::once(async move { Ok(data) }).boxed(),
        }
    }

    /// Pull-style source backed by an iterator of chunks.
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        I::IntoIter: Send + 'static,
        B: Into<Bytes>,
    {
        Self {
            stream: stream::iter(chunks.into_iter().map(|chunk| Ok(chunk.into()))).boxed(),
        }
    }

    /// Pull-style source backed by an arbitrary stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes, StorageError>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
        }
    }

    /// Push-style source: chunks sent to the returned sink are written in
    /// order; the source ends when the sink is dropped or [`ByteSink::finish`]
    /// is called.
    pub fn channel(buffer: usize) -> (ByteSink, ByteSource) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (ByteSink { tx }, Self::from_stream(stream))
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }

    /// Drain the source into one contiguous buffer.
    pub async fn collect(self) -> Result<Bytes, StorageError> {
        collect_stream(self.stream).await
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource").finish_non_exhaustive()
    }
}

impl From<Bytes> for ByteSource {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static [u8]> for ByteSource {
    fn from(data: &'static [u8]) -> Self {
        Self::from_bytes(data)
    }
}

impl From<String> for ByteSource {
    fn from(data: String) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static str> for ByteSource {
    fn from(data: &'static str) -> Self {
        Self::from_bytes(data)
    }
}

/// Producer half of a push-style [`ByteSource`].
#[derive(Debug)]
pub struct ByteSink {
    tx: mpsc::Sender<Result<Bytes, StorageError>>,
}

impl ByteSink {
    /// Send one chunk, waiting while the consumer is behind.
    ///
    /// Fails if the writer already gave up on the source.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<(), StorageError> {
        self.tx.send(Ok(chunk.into())).await.map_err(|_| {
            StorageError::backend(
                "writer stopped consuming input",
                crate::error::OpContext::for_operation("write"),
            )
        })
    }

    /// Abort the write: the consumer sees `err` as the next item.
    pub async fn fail(self, err: StorageError) {
        // The writer may already be gone; nothing else to notify
        let _ = self.tx.send(Err(err)).await;
    }

    /// End of input.
    pub fn finish(self) {}
}

pub(crate) async fn collect_stream(mut stream: ByteStream) -> Result<Bytes, StorageError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Split `data` into a stream of chunks of at most `chunk_size` bytes.
pub(crate) fn chunked(data: Bytes, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect();
    stream::iter(chunks.into_iter().map(Ok)).boxed()
}
