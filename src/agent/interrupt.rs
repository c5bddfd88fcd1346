//! Interrupt controller: ownership of the single in-flight generation.
//!
//! [`InterruptController::begin`] hands out a [`GenerationHandle`]. Once a
//! backend stream is attached, a pump task forwards its events to the
//! handle until the handle's token is cancelled, at which point the pump
//! drops the stream (closing the backend request) and exits. `begin`
//! cancels and waits for any previous pump before returning, so at most
//! one generation is ever active.

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::providers::{EventStream, StreamEvent};

const EVENT_BUFFER: usize = 64;

struct ActiveGeneration {
    id: u64,
    token: CancellationToken,
    // Resolves (with a closed error) once the pump or unattached handle is gone.
    stopped: oneshot::Receiver<()>,
}

/// Owned handle to one generation.
///
/// Exactly one exists per active generation; it is consumed by
/// [`InterruptController::cancel`] or [`InterruptController::complete`].
pub struct GenerationHandle {
    id: u64,
    token: CancellationToken,
    alive: Option<oneshot::Sender<()>>,
    events: Option<mpsc::Receiver<Result<StreamEvent>>>,
}

impl GenerationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Start forwarding `stream` through this handle.
    pub fn attach(&mut self, mut stream: EventStream) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token = self.token.clone();
        let alive = self.alive.take();
        let id = self.id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(event) => {
                            if token.is_cancelled() || tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            drop(stream);
            drop(alive);
            debug!(generation = id, "Generation stream closed");
        });
        self.events = Some(rx);
    }

    /// Next event, or `None` once the stream ended or the handle was
    /// cancelled. Nothing is returned after cancellation is observed.
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        if self.token.is_cancelled() {
            return None;
        }
        let events = self.events.as_mut()?;
        let event = events.recv().await?;
        if self.token.is_cancelled() {
            return None;
        }
        Some(event)
    }
}

/// Per-agent owner of the active generation.
#[derive(Default)]
pub struct InterruptController {
    active: Option<ActiveGeneration>,
    next_id: u64,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new generation, first cancelling and awaiting any active one.
    pub async fn begin(&mut self) -> GenerationHandle {
        if let Some(previous) = self.active.take() {
            debug!(generation = previous.id, "Superseding active generation");
            previous.token.cancel();
            let _ = previous.stopped.await;
        }

        self.next_id += 1;
        let token = CancellationToken::new();
        let (alive, stopped) = oneshot::channel();
        self.active = Some(ActiveGeneration {
            id: self.next_id,
            token: token.clone(),
            stopped,
        });
        GenerationHandle {
            id: self.next_id,
            token,
            alive: Some(alive),
            events: None,
        }
    }

    /// Cancel a generation and wait until its stream has stopped.
    pub async fn cancel(&mut self, handle: GenerationHandle) {
        debug!(generation = handle.id, "Cancelling generation");
        self.release(handle).await;
    }

    /// Retire a generation that ran to completion.
    pub async fn complete(&mut self, handle: GenerationHandle) {
        self.release(handle).await;
    }

    /// Whether a generation is active (not yet cancelled or completed).
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.token.is_cancelled())
    }

    async fn release(&mut self, handle: GenerationHandle) {
        let id = handle.id;
        handle.token.cancel();
        drop(handle);
        if self.active.as_ref().is_some_and(|active| active.id == id) {
            if let Some(active) = self.active.take() {
                let _ = active.stopped.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;

    fn events(items: Vec<StreamEvent>) -> EventStream {
        stream::iter(items.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn test_attached_stream_forwards_events() {
        let mut controller = InterruptController::new();
        let mut handle = controller.begin().await;
        handle.attach(events(vec![
            StreamEvent::Content("he".into()),
            StreamEvent::Content("llo".into()),
            StreamEvent::Done,
        ]));

        assert_eq!(handle.next().await.unwrap().unwrap(), StreamEvent::Content("he".into()));
        assert_eq!(handle.next().await.unwrap().unwrap(), StreamEvent::Content("llo".into()));
        assert_eq!(handle.next().await.unwrap().unwrap(), StreamEvent::Done);
        assert!(handle.next().await.is_none());

        assert!(controller.is_active());
        controller.complete(handle).await;
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn test_begin_supersedes_active_generation() {
        let mut controller = InterruptController::new();
        let mut first = controller.begin().await;
        first.attach(stream::pending().boxed());

        let second = tokio::time::timeout(Duration::from_secs(1), controller.begin())
            .await
            .expect("begin must not hang on a pending stream");

        assert!(first.is_cancelled());
        assert!(first.next().await.is_none());
        assert!(!second.is_cancelled());
        assert!(controller.is_active());
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_no_events_after_cancel() {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut controller = InterruptController::new();
        let mut handle = controller.begin().await;
        handle.attach(rx.boxed());

        tx.unbounded_send(Ok(StreamEvent::Content("a".into()))).unwrap();
        assert_eq!(handle.next().await.unwrap().unwrap(), StreamEvent::Content("a".into()));

        controller.cancel(handle).await;
        assert!(!controller.is_active());
        // The pump has exited, so its stream (and this receiver) is gone.
        assert!(tx.unbounded_send(Ok(StreamEvent::Done)).is_err());
    }

    #[tokio::test]
    async fn test_cancel_unattached_handle() {
        let mut controller = InterruptController::new();
        let handle = controller.begin().await;
        controller.cancel(handle).await;
        assert!(!controller.is_active());
        let next = controller.begin().await;
        assert_eq!(next.id(), 2);
    }
}
