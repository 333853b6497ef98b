// src/coordinator/exception_monitor.rs

//! A registry of handlers keyed by `ErrorKind`, draining a bounded queue on one
//! background task. Handlers enqueue follow-up work (e.g. a retry, an alarm) rather
//! than running it inline, so a slow handler cannot stall the drain loop for other
//! exceptions. Grounded on the original exception-routing component that every
//! non-4xx failure in the request path is forwarded to.

use crate::core::errors::ErrorKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub req_id: String,
    pub kind: ErrorKind,
    pub detail: String,
}

#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    async fn handle(&self, event: &ExceptionEvent);
}

#[derive(Clone)]
pub struct ExceptionMonitorHandle {
    tx: mpsc::Sender<ExceptionEvent>,
}

impl ExceptionMonitorHandle {
    pub async fn report(&self, event: ExceptionEvent) {
        if self.tx.send(event).await.is_err() {
            warn!("exception monitor task is not running, dropping event");
        }
    }
}

pub struct ExceptionMonitor {
    rx: mpsc::Receiver<ExceptionEvent>,
    handlers: HashMap<ErrorKind, Vec<Arc<dyn ExceptionHandler>>>,
}

impl ExceptionMonitor {
    pub fn new(channel_capacity: usize) -> (ExceptionMonitorHandle, Self) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        (ExceptionMonitorHandle { tx }, Self { rx, handlers: HashMap::new() })
    }

    pub fn register(&mut self, kind: ErrorKind, handler: Arc<dyn ExceptionHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            crate::core::metrics::REQUEST_RETRIES_TOTAL
                .with_label_values(&[&event.kind.to_string()])
                .inc();
            let Some(handlers) = self.handlers.get(&event.kind) else {
                warn!(req_id = %event.req_id, kind = %event.kind, "no handler registered for exception kind");
                continue;
            };
            for handler in handlers {
                handler.handle(&event).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler(Arc<AtomicU32>);

    #[async_trait]
    impl ExceptionHandler for CountingHandler {
        async fn handle(&self, _event: &ExceptionEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_handler_for_its_kind() {
        let (handle, mut monitor) = ExceptionMonitor::new(8);
        let count = Arc::new(AtomicU32::new(0));
        monitor.register(ErrorKind::ConnPErr, Arc::new(CountingHandler(count.clone())));

        let run = tokio::spawn(monitor.run());
        handle
            .report(ExceptionEvent { req_id: "r1".into(), kind: ErrorKind::ConnPErr, detail: "x".into() })
            .await;
        handle
            .report(ExceptionEvent { req_id: "r2".into(), kind: ErrorKind::ConnDErr, detail: "y".into() })
            .await;
        drop(handle);
        let _ = run.await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
