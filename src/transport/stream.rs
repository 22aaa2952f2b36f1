use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::transport::tunnel::TunnelSession;
use crate::Result;

/// An open content stream.
///
/// When the content came through a tunnel, the stream owns the tunnel and the
/// tunnel is torn down after the reader is released, on drop or `close`.
pub struct ContentStream {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    session: Option<TunnelSession>,
}

impl ContentStream {
    pub fn new(reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            reader: Box::pin(reader),
            session: None,
        }
    }

    pub(crate) fn with_session(reader: impl AsyncRead + Send + 'static, session: TunnelSession) -> Self {
        Self {
            reader: Box::pin(reader),
            session: Some(session),
        }
    }

    pub fn is_tunneled(&self) -> bool {
        self.session.is_some()
    }

    /// Drains the stream, giving up as soon as `cancel` fires.
    pub async fn read_to_end(&mut self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
            read = self.reader.read_to_end(&mut buf) => {
                read?;
                Ok(buf)
            }
        }
    }

    /// Releases the reader, then tears down the tunnel and waits for it.
    pub async fn close(self) {
        let ContentStream { reader, session } = self;
        drop(reader);
        if let Some(session) = session {
            session.close().await;
        }
    }
}

impl AsyncRead for ContentStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.reader.as_mut().poll_read(cx, buf)
    }
}

impl std::fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStream")
            .field("tunneled", &self.is_tunneled())
            .finish_non_exhaustive()
    }
}
