//! Response body tee used by the executing request.
//!
//! [`CaptureBody`] forwards every frame of the handler's body to the client as it
//! is produced and keeps a copy of the data frames. When the inner body ends, the
//! collected bytes are handed to a completion callback, and the body only reports
//! end-of-stream once that callback has resolved. A failing callback is yielded
//! as the final body error.
//!
//! The transport may drop the body before polling it to the end (hyper stops
//! after the last data frame of a fixed-length body, and a disconnected client
//! stops it at any point). Dropping an unfinished `CaptureBody` drains the rest
//! of the inner body on a background task and runs the callback there.

use crate::error::AppError;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use http_body::{Body as _, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::runtime::Handle;

pub type CompletionFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send>>;

/// Called once with the full captured body.
pub type OnComplete = Box<dyn FnOnce(Bytes) -> CompletionFuture + Send>;

/// A response that took over the connection cannot be captured or replayed.
pub fn is_connection_takeover(response: &Response) -> bool {
    response.status() == StatusCode::SWITCHING_PROTOCOLS
}

/// Wraps the body of `response` so its bytes are captured on the way out.
pub fn capture_response(response: Response, on_complete: OnComplete) -> Response {
    response.map(|body| Body::new(CaptureBody::new(body, on_complete)))
}

pub struct CaptureBody {
    inner: Body,
    buffer: BytesMut,
    on_complete: Option<OnComplete>,
    completing: Option<CompletionFuture>,
    pending_error: Option<axum::Error>,
    finished: bool,
}

impl CaptureBody {
    pub fn new(inner: Body, on_complete: OnComplete) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            on_complete: Some(on_complete),
            completing: None,
            pending_error: None,
            finished: false,
        }
    }

    fn start_completion(&mut self) {
        match self.on_complete.take() {
            Some(on_complete) => {
                let captured = self.buffer.split().freeze();
                self.completing = Some(on_complete(captured));
            }
            None => self.finished = true,
        }
    }
}

impl http_body::Body for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            if let Some(completing) = this.completing.as_mut() {
                let outcome = ready!(completing.as_mut().poll(cx));
                this.completing = None;
                this.finished = true;

                return match outcome {
                    Err(e) => Poll::Ready(Some(Err(axum::Error::new(e)))),
                    Ok(()) => Poll::Ready(this.pending_error.take().map(Err)),
                };
            }

            if this.finished {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        this.buffer.extend_from_slice(data);
                    }
                    return Poll::Ready(Some(Ok(frame)));
                }
                Some(Err(e)) => {
                    this.pending_error = Some(e);
                    this.start_completion();
                }
                None => this.start_completion(),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        if self.finished {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("Response body dropped outside a runtime, capture abandoned");
            return;
        };

        if let Some(completing) = self.completing.take() {
            runtime.spawn(async move {
                if let Err(e) = completing.await {
                    tracing::warn!("Background response capture failed: {}", e);
                }
            });
            return;
        }

        let Some(on_complete) = self.on_complete.take() else {
            return;
        };
        let mut inner = std::mem::replace(&mut self.inner, Body::empty());
        let mut buffer = std::mem::take(&mut self.buffer);

        runtime.spawn(async move {
            while let Some(frame) =
                std::future::poll_fn(|cx| Pin::new(&mut inner).poll_frame(cx)).await
            {
                match frame {
                    Ok(frame) => {
                        if let Some(data) = frame.data_ref() {
                            buffer.extend_from_slice(data);
                        }
                    }
                    Err(_) => break,
                }
            }

            if let Err(e) = on_complete(buffer.freeze()).await {
                tracing::warn!("Background response capture failed: {}", e);
            }
        });
    }
}
