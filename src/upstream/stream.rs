//! Pull-based response body relay with byte accounting.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;

type Inner = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;
type CompletionHook = Box<dyn FnOnce(u64) + Send>;

/// Wraps the upstream body stream, counting bytes as the client pulls
/// them. The hook fires once per completed transfer. Unsized bodies
/// complete on the final poll; fixed-length bodies complete on drop once
/// every declared byte was delivered, because the server stops polling at
/// the declared length and a final `None` never arrives. A client that
/// disconnects mid-body leaves the transfer incomplete and unmetered.
pub struct MeteredStream {
    inner: Inner,
    declared: Option<u64>,
    delivered: u64,
    on_complete: Option<CompletionHook>,
}

impl MeteredStream {
    pub fn new<S>(
        inner: S,
        declared: Option<u64>,
        on_complete: impl FnOnce(u64) + Send + 'static,
    ) -> Self
    where
        S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            declared,
            delivered: 0,
            on_complete: Some(Box::new(on_complete)),
        }
    }
}

impl Stream for MeteredStream {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.delivered += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                // The transfer is over either way; account what was sent.
                if let Some(hook) = self.on_complete.take() {
                    hook(self.delivered);
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let Some(hook) = self.on_complete.take() {
                    hook(self.delivered);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        if Some(self.delivered) == self.declared {
            if let Some(hook) = self.on_complete.take() {
                hook(self.delivered);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn chunks(sizes: &[usize]) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        let items: Vec<Result<Bytes, reqwest::Error>> = sizes
            .iter()
            .map(|&n| Ok(Bytes::from(vec![0u8; n])))
            .collect();
        futures_util::stream::iter(items)
    }

    #[tokio::test]
    async fn hook_fires_with_total_bytes_at_end() {
        let total = Arc::new(AtomicU64::new(u64::MAX));
        let seen = total.clone();
        let mut stream = MeteredStream::new(chunks(&[100, 250, 7]), None, move |n| {
            seen.store(n, Ordering::SeqCst);
        });

        while stream.next().await.is_some() {}
        assert_eq!(total.load(Ordering::SeqCst), 357);
    }

    #[tokio::test]
    async fn fixed_length_body_is_accounted_without_a_final_poll() {
        // A server writing a content-length body drops the stream as soon
        // as the declared bytes are out, never polling through to `None`.
        let total = Arc::new(AtomicU64::new(u64::MAX));
        let seen = total.clone();
        let mut stream = MeteredStream::new(chunks(&[100, 107]), Some(207), move |n| {
            seen.store(n, Ordering::SeqCst);
        });

        stream.next().await;
        stream.next().await;
        drop(stream);
        assert_eq!(total.load(Ordering::SeqCst), 207);
    }

    #[tokio::test]
    async fn dropped_stream_never_fires_the_hook() {
        let fired = Arc::new(AtomicU64::new(0));
        let seen = fired.clone();
        let mut stream = MeteredStream::new(chunks(&[100, 100]), None, move |_| {
            seen.store(1, Ordering::SeqCst);
        });

        stream.next().await;
        drop(stream);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn partially_delivered_fixed_length_body_is_not_metered() {
        let fired = Arc::new(AtomicU64::new(0));
        let seen = fired.clone();
        let mut stream = MeteredStream::new(chunks(&[100, 100]), Some(200), move |_| {
            seen.store(1, Ordering::SeqCst);
        });

        stream.next().await;
        drop(stream);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_body_reports_zero() {
        let total = Arc::new(AtomicU64::new(u64::MAX));
        let seen = total.clone();
        let mut stream = MeteredStream::new(chunks(&[]), None, move |n| {
            seen.store(n, Ordering::SeqCst);
        });

        assert!(stream.next().await.is_none());
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }
}
