//! Response bodies produced by the router.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::mpsc;

use crate::error::ProxyError;

/// Body of a routed response.
///
/// Replayed pages and rewritten HTML are complete in memory. Other recorded
/// responses arrive over a channel while the origin is still sending them.
#[derive(Debug)]
pub enum ResponseBody {
    /// Complete body; taken on the first poll.
    Full(Option<Bytes>),
    /// Chunks forwarded as they arrive. An `Err` item ends the body early.
    Channel(mpsc::Receiver<Result<Bytes, ProxyError>>),
}

impl ResponseBody {
    /// Creates a streaming body and the sender that feeds it.
    ///
    /// The body ends when every sender is dropped.
    pub fn channel(depth: usize) -> (mpsc::Sender<Result<Bytes, ProxyError>>, Self) {
        let (tx, rx) = mpsc::channel(depth);
        (tx, Self::Channel(rx))
    }

    /// Whether the whole body is already in memory.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::Full(Some(bytes))
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ProxyError>>> {
        match self.get_mut() {
            Self::Full(bytes) => Poll::Ready(
                bytes
                    .take()
                    .filter(|b| !b.is_empty())
                    .map(|b| Ok(Frame::data(b))),
            ),
            Self::Channel(rx) => rx
                .poll_recv(cx)
                .map(|item| item.map(|chunk| chunk.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Full(bytes) => bytes.as_ref().is_none_or(Bytes::is_empty),
            Self::Channel(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::Full(bytes) => {
                SizeHint::with_exact(bytes.as_ref().map_or(0, |b| b.len() as u64))
            }
            Self::Channel(_) => SizeHint::default(),
        }
    }
}
