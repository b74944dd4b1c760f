//! Debounced batching of task updates.
//!
//! Every update restarts a short debounce window. When the window elapses,
//! all packs accumulated since the last batch are sent as one
//! `onTaskUpdate`; later updates of the same task replace earlier ones
//! in place. A single background task owns the buffer and performs every
//! send, so batches leave in order and a flush always waits for the batch
//! before it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use suiterun_core::{TaskId, TaskPack};
use suiterun_proto::{BridgeError, WorkerNotification, WorkerRpc};

/// Destination of update batches.
#[async_trait]
pub trait UpdateSink: Send + Sync + 'static {
    async fn send_packs(&self, packs: Vec<TaskPack>) -> Result<(), BridgeError>;
}

#[async_trait]
impl UpdateSink for WorkerRpc {
    async fn send_packs(&self, packs: Vec<TaskPack>) -> Result<(), BridgeError> {
        self.notify(WorkerNotification::OnTaskUpdate { packs })
    }
}

/// Latest pack per task, in first-update order.
#[derive(Default)]
struct PackBuffer {
    packs: Vec<TaskPack>,
    index: HashMap<TaskId, usize>,
}

impl PackBuffer {
    fn insert(&mut self, pack: TaskPack) {
        match self.index.get(pack.id()) {
            Some(&i) => self.packs[i] = pack,
            None => {
                self.index.insert(pack.id().clone(), self.packs.len());
                self.packs.push(pack);
            }
        }
    }

    fn take(&mut self) -> Vec<TaskPack> {
        self.index.clear();
        std::mem::take(&mut self.packs)
    }
}

enum Command {
    Update(TaskPack),
    Flush(oneshot::Sender<()>),
}

/// Handle to the batching task of one worker run.
pub struct UpdateBatcher {
    tx: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

impl UpdateBatcher {
    /// Start the batching task. Must be called inside a tokio runtime.
    pub fn spawn<S: UpdateSink>(sink: S, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_batcher(sink, debounce, rx));
        Self { tx, handle }
    }

    /// Record the latest result of a task.
    pub fn update(&self, pack: TaskPack) {
        if self.tx.send(Command::Update(pack)).is_err() {
            warn!("Update batcher stopped, dropping task update");
        }
    }

    /// Send everything accumulated so far, after any batch in flight.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Deliver the final batch and stop the batching task.
    pub async fn close(self) {
        let Self { tx, handle } = self;
        drop(tx);
        if let Err(e) = handle.await {
            warn!(error = %e, "Update batcher task failed");
        }
    }
}

async fn run_batcher<S: UpdateSink>(
    sink: S,
    debounce: Duration,
    rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut commands = UnboundedReceiverStream::new(rx);
    let mut buffer = PackBuffer::default();
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = commands.next() => command,
                _ = sleep_until(at) => {
                    deadline = None;
                    send_batch(&sink, &mut buffer).await;
                    continue;
                }
            },
            None => commands.next().await,
        };

        match command {
            Some(Command::Update(pack)) => {
                buffer.insert(pack);
                deadline = Some(Instant::now() + debounce);
            }
            Some(Command::Flush(done)) => {
                deadline = None;
                send_batch(&sink, &mut buffer).await;
                let _ = done.send(());
            }
            None => {
                send_batch(&sink, &mut buffer).await;
                break;
            }
        }
    }
}

async fn send_batch<S: UpdateSink>(sink: &S, buffer: &mut PackBuffer) {
    let packs = buffer.take();
    if packs.is_empty() {
        return;
    }
    let count = packs.len();
    match sink.send_packs(packs).await {
        Ok(()) => debug!(packs = count, "Flushed task updates"),
        Err(e) => warn!(error = %e, packs = count, "Failed to send task updates"),
    }
}
