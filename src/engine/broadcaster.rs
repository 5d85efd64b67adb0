use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::EngineInner;
use crate::model::{EventMessage, ExhibitId, Phase, ProgressEvent};

/// Fan-out of wire envelopes to every connected subscriber.
#[derive(Clone)]
pub struct EventHub {
  tx: broadcast::Sender<EventMessage>,
}

impl EventHub {
  pub fn new() -> Self {
    // Small buffer; consumers should be fast. A subscriber that lags simply
    // skips ahead, it never blocks the drain loop or other subscribers.
    let (tx, _) = broadcast::channel(512);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
    self.tx.subscribe()
  }

  pub fn emit(&self, message: EventMessage) {
    let _ = self.tx.send(message);
  }
}

impl Default for EventHub {
  fn default() -> Self {
    Self::new()
  }
}

pub(crate) const DRAIN_IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Single per-process drain loop: moves events from the per-exhibit queues
/// onto the hub. The queues are fed from blocking worker threads, so this
/// polls rather than waits; an idle pass backs off briefly.
pub(crate) fn spawn_drain_loop(inner: Arc<EngineInner>) {
  tokio::spawn(async move {
    loop {
      if drain_pass(&inner) {
        tokio::task::yield_now().await;
      } else {
        tokio::time::sleep(DRAIN_IDLE_BACKOFF).await;
      }
    }
  });
}

/// One pass over all queues, draining at most one event per queue so a
/// chatty clone cannot starve a quiet one. Returns whether anything moved.
pub(crate) fn drain_pass(inner: &EngineInner) -> bool {
  let mut drained = false;
  for exhibit_id in inner.registry.queue_ids() {
    let Some(event) = inner.registry.try_pop(exhibit_id) else {
      continue;
    };
    drained = true;

    let terminal = event.is_terminal();
    let message = envelope(exhibit_id, event);
    inner.registry.cache_put(exhibit_id, message.clone());
    inner.hub.emit(message);

    if terminal {
      // The cache entry stays so late reconnects still see the outcome.
      // A job admitted for this exhibit while the finished one was still
      // running shares this queue; anything it sends after removal goes to
      // a dropped receiver.
      inner.registry.remove_queue(exhibit_id);
      tracing::debug!(exhibit_id, "sync queue retired");
    }
  }
  drained
}

/// Queue item to wire envelope, phase for phase.
pub(crate) fn envelope(exhibit_id: ExhibitId, event: ProgressEvent) -> EventMessage {
  match event {
    ProgressEvent::Waiting { message } => EventMessage {
      phase: Phase::Waiting,
      exhibit_id,
      message: Some(message),
      output: None,
    },
    ProgressEvent::Progress(update) => EventMessage {
      phase: Phase::Progress,
      exhibit_id,
      message: None,
      output: serde_json::to_value(&update).ok(),
    },
    ProgressEvent::Output { line } => EventMessage {
      phase: Phase::Syncing,
      exhibit_id,
      message: None,
      output: Some(serde_json::Value::String(line)),
    },
    ProgressEvent::Finished => EventMessage {
      phase: Phase::Finished,
      exhibit_id,
      message: None,
      output: None,
    },
    ProgressEvent::Error { message, detail } => EventMessage {
      phase: Phase::Error,
      exhibit_id,
      message: Some(message),
      output: (!detail.is_empty()).then_some(serde_json::Value::String(detail)),
    },
  }
}
