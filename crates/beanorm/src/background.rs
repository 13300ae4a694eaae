//! Background queries on a fixed worker pool.
//!
//! Every job runs on a worker thread with its own runtime, `Cx` and
//! read-only transaction, so it shares no persistence context with the
//! caller. List results are detached copies.
//!
//! Each job gets a request-scoped `Cx` when it is submitted. Cancelling a
//! [`BackgroundQuery`] cancels that context, so the job stops at its next
//! checkpoint (or never begins if it is still queued), and sends a cancel
//! hint to the store for the job's transaction. The result is suppressed;
//! the worker still rolls back any transaction it started.

use crate::pipeline::{find_count_in, find_ids_in, find_list_in, find_rows_in};
use crate::server::Server;
use asupersync::runtime::RuntimeBuilder;
use asupersync::types::CancelKind;
use beanorm_core::{BeanRef, Cx, EntityId, Error, Outcome, Result, Row, Store};
use beanorm_query::Query;
use beanorm_session::{Engine, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// `std::thread` workers fed by a channel.
pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("beanorm-bg-{index}"))
                .spawn(move || work(&receiver))
                .map_err(|e| Error::Custom(format!("failed to start background worker: {e}")))?;
            handles.push(handle);
        }
        tracing::debug!(workers = size, "Background workers started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            size,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn submit(&self, job: Job) -> Result<()> {
        match locked(&self.sender).as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| Error::Custom("background workers have stopped".to_string())),
            None => Err(Error::Custom("background workers have stopped".to_string())),
        }
    }
}

fn work(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = locked(receiver).recv();
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        locked(&self.sender).take();
        let current = std::thread::current().id();
        for handle in locked(&self.handles).drain(..) {
            if handle.thread().id() != current && handle.join().is_err() {
                tracing::warn!("Background worker panicked");
            }
        }
    }
}

enum Slot<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    /// The job's context; cancelled along with the handle.
    cx: Cx,
    cancelled: AtomicBool,
    tx_id: Mutex<Option<u64>>,
}

impl<T> Shared<T> {
    fn deliver(&self, result: Result<T>) {
        let mut slot = locked(&self.slot);
        if let Slot::Pending = *slot {
            *slot = Slot::Ready(result);
            self.ready.notify_all();
        }
    }
}

/// Worker-side end of a background query. Delivers an error if dropped
/// without a result, e.g. when the job panicked.
struct Completion<T> {
    shared: Arc<Shared<T>>,
    store: Arc<dyn Store>,
}

impl<T> Completion<T> {
    /// Record the job's transaction; hints at once when already cancelled.
    fn started(&self, tx_id: u64) {
        *locked(&self.shared.tx_id) = Some(tx_id);
        if self.shared.cancelled.load(Ordering::Acquire) {
            self.store.cancel_hint(tx_id);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    fn finish(&self, result: Result<T>) {
        self.shared.deliver(result);
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.shared
            .deliver(Err(Error::Custom("background query did not complete".to_string())));
    }
}

/// Handle to a query running on a background worker.
pub struct BackgroundQuery<T> {
    shared: Arc<Shared<T>>,
    store: Arc<dyn Store>,
}

impl<T> std::fmt::Debug for BackgroundQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundQuery")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T> BackgroundQuery<T> {
    /// Block until the worker has finished, then return its result.
    ///
    /// A cancelled query yields `Error::Cancelled` once the worker is done.
    pub fn wait(self) -> Result<T> {
        let mut slot = locked(&self.shared.slot);
        while let Slot::Pending = *slot {
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => result,
            Slot::Pending | Slot::Taken => Err(Error::Custom("background result already taken".to_string())),
        }
    }

    /// The result, if the worker has finished. Returns it at most once.
    pub fn try_wait(&self) -> Option<Result<T>> {
        let mut slot = locked(&self.shared.slot);
        if !matches!(*slot, Slot::Ready(_)) {
            return None;
        }
        let taken = std::mem::replace(&mut *slot, Slot::Taken);
        if self.is_cancelled() {
            return Some(Err(Error::Cancelled));
        }
        match taken {
            Slot::Ready(result) => Some(result),
            Slot::Pending | Slot::Taken => None,
        }
    }

    /// Ask the store to stop the query and drop its result.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared
            .cx
            .cancel_with(CancelKind::User, Some("background query cancelled"));
        let tx_id = *locked(&self.shared.tx_id);
        tracing::debug!(tx = ?tx_id, "Background query cancelled");
        if let Some(tx_id) = tx_id {
            self.store.cancel_hint(tx_id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Has the worker finished, with or without a result?
    pub fn is_done(&self) -> bool {
        !matches!(*locked(&self.shared.slot), Slot::Pending)
    }
}

fn into_result<T>(outcome: Outcome<T, Error>) -> Result<T> {
    match outcome {
        Outcome::Ok(value) => Ok(value),
        Outcome::Err(e) => Err(e),
        Outcome::Cancelled(_) => Err(Error::Cancelled),
        Outcome::Panicked(_) => Err(Error::Custom("background query panicked".to_string())),
    }
}

fn run_job<T, F>(engine: &Engine, completion: &Completion<T>, label: &'static str, f: F) -> Result<T>
where
    F: AsyncFnOnce(&Engine, &Cx, &mut Transaction) -> Outcome<T, Error>,
{
    let rt = RuntimeBuilder::current_thread()
        .build()
        .map_err(|e| Error::Custom(format!("failed to build background runtime: {e:?}")))?;
    let cx = completion.shared.cx.clone();
    rt.block_on(async {
        let mut tx = into_result(engine.begin(&cx, true).await)?;
        completion.started(tx.id());
        let outcome = f(engine, &cx, &mut tx).await;
        if let Outcome::Err(e) = tx.rollback(&cx).await {
            tracing::warn!(query = label, error = %e, "Background rollback failed");
        }
        tracing::debug!(query = label, tx = tx.id(), cancelled = completion.is_cancelled(), "Background query finished");
        into_result(outcome)
    })
}

impl Server {
    fn spawn_background<T, F>(&self, label: &'static str, f: F) -> BackgroundQuery<T>
    where
        T: Send + 'static,
        F: AsyncFnOnce(&Engine, &Cx, &mut Transaction) -> Outcome<T, Error> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
            cx: Cx::for_request(),
            cancelled: AtomicBool::new(false),
            tx_id: Mutex::new(None),
        });
        let store = Arc::clone(self.engine.store());
        let completion = Completion {
            shared: Arc::clone(&shared),
            store: Arc::clone(&store),
        };
        let engine = Arc::clone(&self.engine);
        let submitted = self.workers.submit(Box::new(move || {
            let result = run_job(&engine, &completion, label, f);
            completion.finish(result);
        }));
        if let Err(e) = submitted {
            shared.deliver(Err(e));
        }
        BackgroundQuery { shared, store }
    }

    /// [`find_count`](Self::find_count) on a background worker.
    pub fn find_count_background(&self, query: Query) -> BackgroundQuery<u64> {
        self.spawn_background("count", async move |engine, cx, tx| {
            find_count_in(engine, cx, tx, &query).await
        })
    }

    /// [`find_ids`](Self::find_ids) on a background worker.
    pub fn find_ids_background(&self, query: Query) -> BackgroundQuery<Vec<EntityId>> {
        self.spawn_background("ids", async move |engine, cx, tx| {
            find_ids_in(engine, cx, tx, &query).await
        })
    }

    /// [`find_list`](Self::find_list) on a background worker; beans are detached copies.
    pub fn find_list_background(&self, query: Query) -> BackgroundQuery<Vec<BeanRef>> {
        self.spawn_background("list", async move |engine, cx, tx| {
            let beans = match find_list_in(engine, cx, tx, &query).await {
                Outcome::Ok(beans) => beans,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            Outcome::Ok(
                beans
                    .iter()
                    .map(|bean| BeanRef::new(bean.read().detached_copy()))
                    .collect(),
            )
        })
    }

    /// [`find_rows`](Self::find_rows) on a background worker.
    pub fn find_rows_background(&self, query: Query) -> BackgroundQuery<Vec<Row>> {
        self.spawn_background("rows", async move |engine, cx, tx| {
            find_rows_in(engine, cx, tx, &query).await
        })
    }
}
