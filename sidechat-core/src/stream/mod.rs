//! Streaming completions.
//!
//! [`run_completion`] drives one request: it opens the body stream through a
//! [`ChatTransport`], decodes deltas, feeds the [`StreamAssembler`] and sends
//! [`StreamEvent`]s back to the session over an unbounded channel.

pub mod assembler;
pub mod sse;

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ChatRequest, ChatTransport};

pub use assembler::{AssemblerState, InvalidTransition, StreamAssembler};
pub use sse::SseDecoder;

/// Identifies one submitted request. Events of superseded requests are dropped.
pub type RequestId = u64;

// =============================================================================
// Events
// =============================================================================

/// Events sent from the streaming task to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The accumulator changed; `html` is the render of the whole of it.
    Render { request_id: RequestId, html: String },

    /// The stream ended normally.
    Finished {
        request_id: RequestId,
        content: String,
    },

    /// Transport failure or non-success status.
    Failed {
        request_id: RequestId,
        error: ApiError,
    },

    /// The cancellation token fired. Nothing is committed.
    Cancelled { request_id: RequestId },
}

impl StreamEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            StreamEvent::Render { request_id, .. }
            | StreamEvent::Finished { request_id, .. }
            | StreamEvent::Failed { request_id, .. }
            | StreamEvent::Cancelled { request_id } => *request_id,
        }
    }
}

/// Sender for stream events.
pub type EventSender = mpsc::UnboundedSender<StreamEvent>;

/// Receiver for stream events.
pub type EventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// Create an event channel for streaming completions.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// =============================================================================
// Driver
// =============================================================================

/// Everything the streaming task needs for one request.
#[derive(Debug, Clone)]
pub struct Completion {
    pub request_id: RequestId,
    pub api_key: String,
    pub request: ChatRequest,
}

/// Run a completion on a spawned task.
pub fn spawn_completion(
    transport: Arc<dyn ChatTransport>,
    completion: Completion,
    cancel: CancellationToken,
    sender: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(run_completion(transport, completion, cancel, sender))
}

/// Drive one completion to a terminal event.
///
/// Exactly one of `Finished`, `Failed` or `Cancelled` is sent last, unless the
/// receiver goes away first. Cancellation is checked before every read.
pub async fn run_completion(
    transport: Arc<dyn ChatTransport>,
    completion: Completion,
    cancel: CancellationToken,
    sender: EventSender,
) {
    let Completion {
        request_id,
        api_key,
        request,
    } = completion;

    let mut assembler = StreamAssembler::new();
    if let Err(e) = assembler.submit() {
        warn!(request_id, error = %e, "Assembler rejected submit");
        return;
    }
    info!(request_id, model = %request.model, "Submitting completion request");

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            cancelled(&mut assembler, request_id, &sender);
            return;
        }
        result = transport.open_stream(&api_key, &request) => result,
    };

    let mut body = match opened {
        Ok(body) => body,
        Err(error) => {
            failed(&mut assembler, request_id, error, &sender);
            return;
        }
    };

    let mut decoder = SseDecoder::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled(&mut assembler, request_id, &sender);
                return;
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for delta in decoder.push(&bytes) {
                    if !render(&mut assembler, request_id, &delta, &sender) {
                        return;
                    }
                }
            }
            Some(Err(error)) => {
                failed(&mut assembler, request_id, error, &sender);
                return;
            }
            None => break,
        }
    }

    if let Some(delta) = decoder.finish() {
        if !render(&mut assembler, request_id, &delta, &sender) {
            return;
        }
    }

    match assembler.finish() {
        Ok(content) => {
            info!(request_id, chars = content.len(), "Completion finished");
            let _ = sender.send(StreamEvent::Finished {
                request_id,
                content,
            });
        }
        Err(e) => warn!(request_id, error = %e, "Assembler rejected finish"),
    }
}

/// Append a delta and forward the new render. Returns `false` once the
/// receiver is gone.
fn render(
    assembler: &mut StreamAssembler,
    request_id: RequestId,
    delta: &str,
    sender: &EventSender,
) -> bool {
    match assembler.push_delta(delta) {
        Ok(Some(html)) => {
            let event = StreamEvent::Render {
                request_id,
                html: html.to_string(),
            };
            if sender.send(event).is_err() {
                debug!(request_id, "Event receiver dropped, stopping stream");
                return false;
            }
            true
        }
        Ok(None) => true,
        Err(e) => {
            warn!(request_id, error = %e, "Dropping delta");
            true
        }
    }
}

fn failed(
    assembler: &mut StreamAssembler,
    request_id: RequestId,
    error: ApiError,
    sender: &EventSender,
) {
    let _ = assembler.fail();
    warn!(request_id, error = %error, "Completion failed");
    let _ = sender.send(StreamEvent::Failed { request_id, error });
}

fn cancelled(assembler: &mut StreamAssembler, request_id: RequestId, sender: &EventSender) {
    let _ = assembler.cancel();
    debug!(request_id, "Completion cancelled");
    let _ = sender.send(StreamEvent::Cancelled { request_id });
}


#[cfg(test)]
mod tests {
    use super::testing::{frame, ManualTransport, ScriptedTransport};
    use super::*;
    use bytes::Bytes;

    fn completion() -> Completion {
        Completion {
            request_id: 7,
            api_key: "sk-test".to_string(),
            request: ChatRequest {
                model: "mistral-small-latest".to_string(),
                messages: Vec::new(),
                stream: true,
            },
        }
    }

    async fn collect(mut receiver: EventReceiver) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_streams_renders_then_finishes() {
        let transport = Arc::new(ScriptedTransport::chunks(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: [DONE]\n",
        ]));
        let (sender, receiver) = event_channel();

        run_completion(transport, completion(), CancellationToken::new(), sender).await;

        assert_eq!(
            collect(receiver).await,
            vec![
                StreamEvent::Render {
                    request_id: 7,
                    html: "Hel".to_string()
                },
                StreamEvent::Render {
                    request_id: 7,
                    html: "Hello".to_string()
                },
                StreamEvent::Finished {
                    request_id: 7,
                    content: "Hello".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_frame_split_across_chunks() {
        let transport = Arc::new(ScriptedTransport::chunks(vec![
            "data: {\"choices\":[{\"del",
            "ta\":{\"content\":\"**bold**\"}}]}\ndata: [DONE]\n",
        ]));
        let (sender, receiver) = event_channel();

        run_completion(transport, completion(), CancellationToken::new(), sender).await;

        let events = collect(receiver).await;
        assert_eq!(
            events[0],
            StreamEvent::Render {
                request_id: 7,
                html: "<strong>bold</strong>".to_string()
            }
        );
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Finished { content, .. }) if content == "**bold**"
        ));
    }

    #[tokio::test]
    async fn test_rejected_request_fails() {
        let transport = Arc::new(ScriptedTransport::rejecting(ApiError::Status {
            status: 401,
            message: "Unauthorized".to_string(),
        }));
        let (sender, receiver) = event_channel();

        run_completion(transport, completion(), CancellationToken::new(), sender).await;

        assert_eq!(
            collect(receiver).await,
            vec![StreamEvent::Failed {
                request_id: 7,
                error: ApiError::Status {
                    status: 401,
                    message: "Unauthorized".to_string()
                }
            }]
        );
    }

    #[tokio::test]
    async fn test_mid_stream_transport_error_fails() {
        let transport = Arc::new(ScriptedTransport::with_results(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n"),
            Err(ApiError::Transport("connection reset".to_string())),
        ]));
        let (sender, receiver) = event_channel();

        run_completion(transport, completion(), CancellationToken::new(), sender).await;

        let events = collect(receiver).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            StreamEvent::Failed { error: ApiError::Transport(msg), .. } if msg == "connection reset"
        ));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_stops_reading() {
        let (transport, body) = ManualTransport::new();
        let (sender, mut receiver) = event_channel();
        let cancel = CancellationToken::new();

        let handle = spawn_completion(Arc::new(transport), completion(), cancel.clone(), sender);

        body.send(Bytes::from(frame("Hel"))).unwrap();
        assert_eq!(
            receiver.recv().await,
            Some(StreamEvent::Render {
                request_id: 7,
                html: "Hel".to_string()
            })
        );

        cancel.cancel();
        handle.await.unwrap();
        let _ = body.send(Bytes::from(frame("lo")));

        assert_eq!(
            receiver.recv().await,
            Some(StreamEvent::Cancelled { request_id: 7 })
        );
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancel_before_open_sends_cancelled_only() {
        let transport = Arc::new(ScriptedTransport::chunks(vec!["data: [DONE]\n"]));
        let (sender, receiver) = event_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        run_completion(transport.clone(), completion(), cancel, sender).await;

        assert_eq!(
            collect(receiver).await,
            vec![StreamEvent::Cancelled { request_id: 7 }]
        );
        assert_eq!(transport.calls(), 0);
    }
}
