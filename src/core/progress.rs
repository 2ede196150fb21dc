use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;

/// 传输进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    /// 0..=100，取整
    pub fn percentage(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let pct = (self.bytes_sent.min(self.total_bytes) as f64 / self.total_bytes as f64) * 100.0;
        pct.round() as u8
    }
}

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

pin_project! {
    /// 统计经过的字节数并回调
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        bytes_sent: u64,
        total_bytes: u64,
        callback: ProgressCallback,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total_bytes: u64, callback: ProgressCallback) -> Self {
        Self {
            inner,
            bytes_sent: 0,
            total_bytes,
            callback,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.bytes_sent += chunk.len() as u64;
                    (this.callback)(TransferProgress {
                        bytes_sent: *this.bytes_sent,
                        total_bytes: *this.total_bytes,
                    });
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}
