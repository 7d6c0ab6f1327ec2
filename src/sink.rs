//! Result delivery back to the presentation layer.

use crate::job::{ConversionResult, Delivery};
use crate::queue::JobQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Callback invoked with each delivered result for one output path.
pub type Observer = Arc<dyn Fn(Delivery) + Send + Sync>;

type Observers = Arc<Mutex<HashMap<PathBuf, Observer>>>;

/// Delivers results in generation order, at most once per generation.
///
/// Accepted results are queued on a channel drained by a single dispatcher
/// task, which invokes the observer registered for the output path. Nothing
/// ever calls an observer on a worker thread or inside `deliver`.
pub struct ResultSink {
    queue: Arc<JobQueue>,
    observers: Observers,
    tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ResultSink {
    /// Creates the sink and spawns its dispatcher. Must be called inside a
    /// Tokio runtime.
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let observers: Observers = Arc::default();
        let dispatcher = tokio::spawn(dispatch(rx, observers.clone()));

        Self {
            queue,
            observers,
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Registers `observer` for `output_path`, replacing any previous one.
    pub fn subscribe(&self, output_path: impl Into<PathBuf>, observer: Observer) {
        self.observers.lock().insert(output_path.into(), observer);
    }

    pub fn unsubscribe(&self, output_path: &Path) -> bool {
        self.observers.lock().remove(output_path).is_some()
    }

    /// Hands `result` to the observer if `generation` is still the latest,
    /// unsettled generation for `output_path`. Stale results are dropped.
    ///
    /// Returns whether the result was accepted for delivery.
    pub fn deliver(&self, output_path: PathBuf, generation: u64, result: ConversionResult) -> bool {
        let Some(tx) = self.sender() else {
            debug!(output_path = %output_path.display(), generation, "Sink closed, dropping result");
            return false;
        };

        let accepted = self.queue.settle(&output_path, generation, || {
            let delivery = Delivery {
                output_path: output_path.clone(),
                generation,
                result,
            };
            if tx.send(delivery).is_err() {
                warn!(output_path = %output_path.display(), "Dispatcher gone, result lost");
            }
        });

        if !accepted {
            debug!(
                output_path = %output_path.display(),
                generation,
                "Dropping stale result"
            );
        }
        accepted
    }

    /// Cancels the outstanding generation for `output_path` and delivers
    /// [`ConversionResult::Cancelled`] for it.
    ///
    /// A conversion already running for that generation keeps running; its
    /// result is discarded when it finishes.
    pub fn cancel(&self, output_path: &Path) -> Option<u64> {
        let tx = self.sender();
        self.queue.cancel(output_path, |generation| {
            let notice = Delivery {
                output_path: output_path.to_path_buf(),
                generation,
                result: ConversionResult::Cancelled,
            };
            match &tx {
                Some(tx) => {
                    if tx.send(notice).is_err() {
                        warn!(
                            output_path = %output_path.display(),
                            "Dispatcher gone, cancel notice lost"
                        );
                    }
                }
                None => debug!(
                    output_path = %output_path.display(),
                    generation,
                    "Sink closed, dropping cancel notice"
                ),
            }
        })
    }

    /// Stops accepting results and waits until every accepted result has
    /// reached its observer. Idempotent.
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!("Result dispatcher failed: {}", e);
            }
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Delivery>> {
        self.tx.lock().clone()
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Delivery>, observers: Observers) {
    while let Some(delivery) = rx.recv().await {
        let observer = observers.lock().get(&delivery.output_path).cloned();
        let Some(observer) = observer else {
            debug!(
                output_path = %delivery.output_path.display(),
                generation = delivery.generation,
                "No observer registered, dropping result"
            );
            continue;
        };

        let output_path = delivery.output_path.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| observer(delivery))).is_err() {
            error!(output_path = %output_path.display(), "Observer panicked");
        }
    }
}
