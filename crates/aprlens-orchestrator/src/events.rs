//! Optional event channel for observers.

use tokio::sync::mpsc;

use aprlens_core::PipelineEvent;

/// Sender half handed to the pipeline; a disconnected or absent receiver
/// never affects the run.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a sink and its receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
