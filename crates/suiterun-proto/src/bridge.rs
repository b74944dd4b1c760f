//! Bidirectional RPC bridge between the orchestrator and one worker.
//!
//! A bridge is a pair of [`Port`]s over an ordered in-memory transport of
//! JSON lines. The worker wraps its port in a [`WorkerRpc`] client: it sends
//! notifications and awaits module responses correlated by request id. The
//! orchestrator drives its port with [`serve`], dispatching every inbound
//! message to an [`OrchestratorHandler`] one at a time, in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use suiterun_core::{FileTree, SnapshotResult, TaskPack, UserConsoleLog};

use crate::error::BridgeError;
use crate::message::{
    CoverageReport, Envelope, ModuleRequest, ModuleResponse, WireMessage, WorkerNotification,
};
use crate::module::{FetchResult, ResolveResult, SourceMap};

/// Error type returned by handler callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Sending half of a port. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender(mpsc::UnboundedSender<String>);

impl PortSender {
    /// Encode and post one envelope.
    pub fn send(&self, body: Envelope) -> Result<(), BridgeError> {
        let line = WireMessage::new(body).encode()?;
        self.0.send(line).map_err(|_| BridgeError::Closed)
    }

    /// Returns true once the receiving port is gone.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// One endpoint of a bridge.
#[derive(Debug)]
pub struct Port {
    tx: PortSender,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Port {
    /// A sender posting to the other endpoint.
    pub fn sender(&self) -> PortSender {
        self.tx.clone()
    }

    fn split(self) -> (PortSender, mpsc::UnboundedReceiver<String>) {
        (self.tx, self.rx)
    }
}

/// Create a connected `(worker, orchestrator)` port pair.
pub fn channel() -> (Port, Port) {
    let (to_orchestrator, from_worker) = mpsc::unbounded_channel();
    let (to_worker, from_orchestrator) = mpsc::unbounded_channel();
    let worker = Port {
        tx: PortSender(to_orchestrator),
        rx: from_orchestrator,
    };
    let orchestrator = Port {
        tx: PortSender(to_worker),
        rx: from_worker,
    };
    (worker, orchestrator)
}

type Waiter = oneshot::Sender<Result<ModuleResponse, String>>;

#[derive(Default)]
struct PendingCalls {
    closed: bool,
    waiters: HashMap<u64, Waiter>,
}

struct RpcInner {
    tx: PortSender,
    pending: Arc<Mutex<PendingCalls>>,
    next_id: AtomicU64,
}

/// Worker-side client of a bridge.
#[derive(Clone)]
pub struct WorkerRpc {
    inner: Arc<RpcInner>,
}

/// Wrap the worker's port and start reading responses.
///
/// Must be called inside a tokio runtime. The reader stops when the
/// orchestrator drops its end; pending requests then fail with
/// [`BridgeError::Closed`].
pub fn connect(port: Port) -> WorkerRpc {
    let (tx, rx) = port.split();
    let pending = Arc::new(Mutex::new(PendingCalls::default()));
    tokio::spawn(read_responses(rx, Arc::clone(&pending)));
    WorkerRpc {
        inner: Arc::new(RpcInner {
            tx,
            pending,
            next_id: AtomicU64::new(1),
        }),
    }
}

async fn read_responses(
    mut rx: mpsc::UnboundedReceiver<String>,
    pending: Arc<Mutex<PendingCalls>>,
) {
    while let Some(line) = rx.recv().await {
        match WireMessage::decode(&line) {
            Ok(WireMessage {
                body: Envelope::Response { id, result },
                ..
            }) => {
                let waiter = pending.lock().await.waiters.remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => warn!(request_id = id, "Response for unknown request"),
                }
            }
            Ok(_) => warn!("Worker received a message that is not a response"),
            Err(e) => warn!(error = %e, "Failed to decode bridge message"),
        }
    }

    debug!("Worker bridge closed");
    let mut pending = pending.lock().await;
    pending.closed = true;
    pending.waiters.clear();
}

impl WorkerRpc {
    /// Post a fire-and-forget notification.
    pub fn notify(&self, message: WorkerNotification) -> Result<(), BridgeError> {
        trace!(method = message.method(), "Sending notification");
        self.inner.tx.send(Envelope::Notify { message })
    }

    /// A raw sender on this bridge, used to report a crash after the
    /// client itself is gone.
    pub fn sender(&self) -> PortSender {
        self.inner.tx.clone()
    }

    async fn call(&self, call: ModuleRequest) -> Result<ModuleResponse, BridgeError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, response) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            if pending.closed {
                return Err(BridgeError::Closed);
            }
            pending.waiters.insert(id, waiter);
        }

        trace!(request_id = id, method = call.method(), "Sending request");
        if let Err(e) = self.inner.tx.send(Envelope::Request { id, call }) {
            self.inner.pending.lock().await.waiters.remove(&id);
            return Err(e);
        }

        response
            .await
            .map_err(|_| BridgeError::Closed)?
            .map_err(BridgeError::Remote)
    }

    /// Fetch the executable form of module `id`.
    pub async fn fetch(&self, id: &str) -> Result<FetchResult, BridgeError> {
        match self.call(ModuleRequest::Fetch { id: id.to_string() }).await? {
            ModuleResponse::Fetch(result) => Ok(result),
            _ => Err(BridgeError::UnexpectedResponse("fetch")),
        }
    }

    /// Resolve an import specifier, relative to `importer` when given.
    pub async fn resolve_id(
        &self,
        id: &str,
        importer: Option<&str>,
    ) -> Result<Option<ResolveResult>, BridgeError> {
        let call = ModuleRequest::ResolveId {
            id: id.to_string(),
            importer: importer.map(str::to_string),
        };
        match self.call(call).await? {
            ModuleResponse::ResolveId(result) => Ok(result),
            _ => Err(BridgeError::UnexpectedResponse("resolveId")),
        }
    }

    /// Source map of module `id`; `force` discards the orchestrator's cached
    /// transform first.
    pub async fn get_source_map(
        &self,
        id: &str,
        force: bool,
    ) -> Result<Option<SourceMap>, BridgeError> {
        let call = ModuleRequest::GetSourceMap {
            id: id.to_string(),
            force,
        };
        match self.call(call).await? {
            ModuleResponse::SourceMap(map) => Ok(map),
            _ => Err(BridgeError::UnexpectedResponse("getSourceMap")),
        }
    }
}

/// Report that the execution context behind `sender` terminated.
pub fn notify_worker_exit(sender: &PortSender, code: i32) -> Result<(), BridgeError> {
    sender.send(Envelope::Notify {
        message: WorkerNotification::OnWorkerExit { code },
    })
}

/// Orchestrator-side method table of a bridge.
///
/// Notification errors are logged and dropped. Request errors are sent
/// back to the worker as a failed response.
#[async_trait]
pub trait OrchestratorHandler: Send + Sync {
    async fn on_collected(&self, files: Vec<FileTree>) -> Result<(), HandlerError>;

    async fn on_task_update(&self, packs: Vec<TaskPack>) -> Result<(), HandlerError>;

    async fn on_user_console_log(&self, log: UserConsoleLog) -> Result<(), HandlerError>;

    async fn on_finished(&self, files: Vec<FileTree>) -> Result<(), HandlerError>;

    async fn snapshot_saved(&self, snapshot: SnapshotResult) -> Result<(), HandlerError>;

    async fn coverage_collected(&self, coverage: CoverageReport) -> Result<(), HandlerError>;

    /// The execution context terminated unexpectedly.
    async fn on_worker_exit(&self, code: i32) -> Result<(), HandlerError>;

    async fn fetch(&self, id: String) -> Result<FetchResult, HandlerError>;

    async fn resolve_id(
        &self,
        id: String,
        importer: Option<String>,
    ) -> Result<Option<ResolveResult>, HandlerError>;

    async fn get_source_map(
        &self,
        id: String,
        force: bool,
    ) -> Result<Option<SourceMap>, HandlerError>;
}

/// Drive the orchestrator's port until the worker side is gone.
///
/// Once `shutdown` fires (or its sender is dropped) no new messages are
/// accepted, but everything already queued is still dispatched.
pub async fn serve(
    port: Port,
    handler: Arc<dyn OrchestratorHandler>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (tx, mut rx) = port.split();
    let mut draining = false;
    let mut handled = 0u64;

    loop {
        let line = if draining {
            rx.recv().await
        } else {
            tokio::select! {
                line = rx.recv() => line,
                _ = &mut shutdown => {
                    draining = true;
                    rx.close();
                    continue;
                }
            }
        };
        let Some(line) = line else {
            break;
        };

        handled += 1;
        dispatch(&line, handler.as_ref(), &tx).await;
    }

    debug!(messages = handled, "Orchestrator bridge closed");
}

async fn dispatch(line: &str, handler: &dyn OrchestratorHandler, tx: &PortSender) {
    let message = match WireMessage::decode(line) {
        Ok(message) => message,
        Err(e) => {
            let preview: String = line.chars().take(200).collect();
            warn!(error = %e, preview = %preview, "Failed to decode bridge message");
            return;
        }
    };

    match message.body {
        Envelope::Notify { message } => {
            let method = message.method();
            if let Err(e) = dispatch_notification(handler, message).await {
                warn!(method, error = %e, "Notification handler failed");
            }
        }
        Envelope::Request { id, call } => {
            let method = call.method();
            let result = dispatch_request(handler, call)
                .await
                .map_err(|e| e.to_string());
            if tx.send(Envelope::Response { id, result }).is_err() {
                debug!(request_id = id, method, "Worker gone before response");
            }
        }
        Envelope::Response { id, .. } => {
            warn!(request_id = id, "Orchestrator received a response");
        }
    }
}

async fn dispatch_notification(
    handler: &dyn OrchestratorHandler,
    message: WorkerNotification,
) -> Result<(), HandlerError> {
    match message {
        WorkerNotification::OnCollected { files } => handler.on_collected(files).await,
        WorkerNotification::OnTaskUpdate { packs } => handler.on_task_update(packs).await,
        WorkerNotification::OnUserConsoleLog { log } => handler.on_user_console_log(log).await,
        WorkerNotification::OnFinished { files } => handler.on_finished(files).await,
        WorkerNotification::SnapshotSaved { snapshot } => handler.snapshot_saved(snapshot).await,
        WorkerNotification::CoverageCollected { coverage } => {
            handler.coverage_collected(coverage).await
        }
        WorkerNotification::OnWorkerExit { code } => handler.on_worker_exit(code).await,
    }
}

async fn dispatch_request(
    handler: &dyn OrchestratorHandler,
    call: ModuleRequest,
) -> Result<ModuleResponse, HandlerError> {
    match call {
        ModuleRequest::Fetch { id } => handler.fetch(id).await.map(ModuleResponse::Fetch),
        ModuleRequest::ResolveId { id, importer } => handler
            .resolve_id(id, importer)
            .await
            .map(ModuleResponse::ResolveId),
        ModuleRequest::GetSourceMap { id, force } => handler
            .get_source_map(id, force)
            .await
            .map(ModuleResponse::SourceMap),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use suiterun_core::ConsoleStream;

    #[derive(Default)]
    struct RecordingHandler {
        methods: StdMutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn record(&self, method: &str) {
            self.methods.lock().unwrap().push(method.to_string());
        }

        fn methods(&self) -> Vec<String> {
            self.methods.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrchestratorHandler for RecordingHandler {
        async fn on_collected(&self, _files: Vec<FileTree>) -> Result<(), HandlerError> {
            self.record("onCollected");
            Ok(())
        }

        async fn on_task_update(&self, _packs: Vec<TaskPack>) -> Result<(), HandlerError> {
            self.record("onTaskUpdate");
            Ok(())
        }

        async fn on_user_console_log(&self, log: UserConsoleLog) -> Result<(), HandlerError> {
            self.record(&format!("log:{}", log.content));
            Ok(())
        }

        async fn on_finished(&self, _files: Vec<FileTree>) -> Result<(), HandlerError> {
            self.record("onFinished");
            Ok(())
        }

        async fn snapshot_saved(&self, _snapshot: SnapshotResult) -> Result<(), HandlerError> {
            self.record("snapshotSaved");
            Ok(())
        }

        async fn coverage_collected(&self, _coverage: CoverageReport) -> Result<(), HandlerError> {
            self.record("coverageCollected");
            Ok(())
        }

        async fn on_worker_exit(&self, code: i32) -> Result<(), HandlerError> {
            self.record(&format!("exit:{code}"));
            Ok(())
        }

        async fn fetch(&self, id: String) -> Result<FetchResult, HandlerError> {
            if id == "missing" {
                return Err("module not found".into());
            }
            Ok(FetchResult::inline(format!("// {id}")))
        }

        async fn resolve_id(
            &self,
            id: String,
            importer: Option<String>,
        ) -> Result<Option<ResolveResult>, HandlerError> {
            Ok(importer.map(|importer| ResolveResult::new(format!("{importer}/{id}"))))
        }

        async fn get_source_map(
            &self,
            _id: String,
            _force: bool,
        ) -> Result<Option<SourceMap>, HandlerError> {
            Ok(None)
        }
    }

    fn log(content: &str) -> WorkerNotification {
        WorkerNotification::OnUserConsoleLog {
            log: UserConsoleLog::new(content, ConsoleStream::Stdout, None),
        }
    }

    #[tokio::test]
    async fn test_requests_are_answered() {
        let (worker, orchestrator) = channel();
        let handler = Arc::new(RecordingHandler::default());
        let (_stop, shutdown) = oneshot::channel();
        let server = tokio::spawn(serve(orchestrator, handler.clone(), shutdown));

        let rpc = connect(worker);
        let fetched = rpc.fetch("/repo/a.ts").await.unwrap();
        assert_eq!(fetched.code.as_deref(), Some("// /repo/a.ts"));

        let resolved = rpc.resolve_id("dep", Some("/repo")).await.unwrap();
        assert_eq!(resolved.unwrap().id, "/repo/dep");
        assert_eq!(rpc.resolve_id("dep", None).await.unwrap(), None);
        assert_eq!(rpc.get_source_map("/repo/a.ts", true).await.unwrap(), None);

        let err = rpc.fetch("missing").await.unwrap_err();
        assert!(matches!(err, BridgeError::Remote(msg) if msg == "module not found"));

        drop(rpc);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_keep_order() {
        let (worker, orchestrator) = channel();
        let handler = Arc::new(RecordingHandler::default());
        let (_stop, shutdown) = oneshot::channel();
        let server = tokio::spawn(serve(orchestrator, handler.clone(), shutdown));

        let rpc = connect(worker);
        let tree = FileTree::new(Path::new("/repo"), "/repo/a.test");
        rpc.notify(WorkerNotification::OnCollected {
            files: vec![tree.clone()],
        })
        .unwrap();
        for i in 0..3 {
            rpc.notify(log(&i.to_string())).unwrap();
        }
        rpc.notify(WorkerNotification::OnFinished { files: vec![tree] })
            .unwrap();

        drop(rpc);
        server.await.unwrap();
        assert_eq!(
            handler.methods(),
            vec!["onCollected", "log:0", "log:1", "log:2", "onFinished"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_messages() {
        let (worker, orchestrator) = channel();
        let handler = Arc::new(RecordingHandler::default());
        let (stop, shutdown) = oneshot::channel();

        // The worker client stays alive, so only the shutdown signal ends the loop.
        let rpc = connect(worker);
        let crash_sender = rpc.sender();
        rpc.notify(log("before")).unwrap();
        notify_worker_exit(&crash_sender, 1).unwrap();
        stop.send(()).unwrap();

        serve(orchestrator, handler.clone(), shutdown).await;
        assert_eq!(handler.methods(), vec!["log:before", "exit:1"]);
        assert!(matches!(rpc.notify(log("late")), Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn test_request_fails_when_orchestrator_is_gone() {
        let (worker, orchestrator) = channel();
        let rpc = connect(worker);
        drop(orchestrator);

        assert!(matches!(
            rpc.fetch("/repo/a.ts").await,
            Err(BridgeError::Closed)
        ));
    }
}
