use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

/// Tees a byte stream: every chunk is forwarded to the client untouched and
/// a copy is pushed onto `tx` for background accumulation. The client never
/// waits on the accumulator — `tx` is unbounded and a full receiver only
/// means capture is skipped, not that forwarding stalls.
pub struct ShadowStream<S> {
    inner: Pin<Box<S>>,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl<S> ShadowStream<S> {
    pub fn new(inner: S, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { inner: Box::pin(inner), tx }
    }
}

impl<S, E> Stream for ShadowStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let _ = self.tx.send(chunk.clone());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Some(Err(std::io::Error::other(e.to_string()))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
