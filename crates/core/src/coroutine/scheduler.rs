use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

use super::CoroutineError;
use super::handle::{CoroutineHandle, Slot};
use super::timer::yield_tick;

pub type TaskId = u64;

/// Per-tick information handed to everything that runs inside a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickContext {
    pub tick: u32,
    pub dt: f32,
}

impl TickContext {
    pub fn new(tick: u32, dt: f32) -> Self {
        Self { tick, dt }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Continuations that ran during this pump.
    pub executed: usize,
    /// Coroutines that ran to completion.
    pub completed: usize,
    /// Continuations that panicked.
    pub faulted: usize,
}

enum Continuation {
    Resume(TaskId),
    Callback(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct Queue {
    entries: VecDeque<Continuation>,
    queued_tasks: HashSet<TaskId>,
}

/// Thread-safe entry point into a scheduler's continuation queue.
///
/// Anything posted here runs on the scheduler's thread during the next pump.
#[derive(Clone, Default)]
pub struct RemoteQueue {
    shared: Arc<Mutex<Queue>>,
}

impl RemoteQueue {
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        self.lock()
            .entries
            .push_back(Continuation::Callback(Box::new(callback)));
    }

    /// Always fails: work posted from here never runs before the next pump.
    pub fn send(&self, _callback: impl FnOnce() + Send + 'static) -> Result<(), CoroutineError> {
        log::error!("synchronous send is not supported; use schedule instead");
        Err(CoroutineError::SynchronousSend)
    }

    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    fn resume(&self, id: TaskId) {
        let mut queue = self.lock();
        // A task woken several times in one tick is only resumed once.
        if queue.queued_tasks.insert(id) {
            queue.entries.push_back(Continuation::Resume(id));
        }
    }

    fn take_batch(&self) -> VecDeque<Continuation> {
        let mut queue = self.lock();
        queue.queued_tasks.clear();
        std::mem::take(&mut queue.entries)
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RemoteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

struct TaskWaker {
    id: TaskId,
    queue: RemoteQueue,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.resume(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.resume(self.id);
    }
}

struct LocalTask {
    future: Pin<Box<dyn Future<Output = ()>>>,
    fail: Option<Box<dyn FnOnce(CoroutineError)>>,
    waker: Waker,
}

impl Drop for LocalTask {
    fn drop(&mut self) {
        if let Some(fail) = self.fail.take() {
            fail(CoroutineError::Abandoned);
        }
    }
}

enum PollOutcome {
    Suspended,
    Completed,
    Faulted,
}

struct Inner {
    tasks: RefCell<HashMap<TaskId, LocalTask>>,
    queue: RemoteQueue,
    next_task: Cell<TaskId>,
    pumping: Cell<bool>,
    tick: Cell<u32>,
}

struct PumpGuard<'a>(&'a Cell<bool>);

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Single-threaded cooperative scheduler driven by the tick loop.
///
/// `run` polls a coroutine once right away; every later resumption happens
/// inside [`pump`](Self::pump). Continuations queued while a pump is running
/// wait for the next pump, so code never runs synchronously on behalf of
/// another caller. The scheduler is `!Send`; use [`remote`](Self::remote) to
/// post work from other threads.
#[derive(Clone)]
pub struct CoroutineScheduler {
    inner: Rc<Inner>,
}

impl Default for CoroutineScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CoroutineScheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                tasks: RefCell::new(HashMap::new()),
                queue: RemoteQueue::default(),
                next_task: Cell::new(1),
                pumping: Cell::new(false),
                tick: Cell::new(0),
            }),
        }
    }

    /// Starts a coroutine. It runs up to its first suspension point before
    /// `run` returns.
    pub fn run<F, T>(&self, future: F) -> CoroutineHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let id = self.inner.next_task.get();
        self.inner.next_task.set(id + 1);

        let slot = Slot::new();
        let completion = Rc::clone(&slot);
        let failure = Rc::clone(&slot);

        let task = LocalTask {
            future: Box::pin(async move {
                let value = future.await;
                Slot::complete(&completion, Ok(value));
            }),
            fail: Some(Box::new(move |error| Slot::complete(&failure, Err(error)))),
            waker: Waker::from(Arc::new(TaskWaker {
                id,
                queue: self.inner.queue.clone(),
            })),
        };

        log::trace!("coroutine {id} started");
        self.poll_task(id, task);
        CoroutineHandle::new(slot)
    }

    /// Queues `callback` to run during the next pump.
    pub fn schedule<F, T>(&self, callback: F) -> CoroutineHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        self.run(async move {
            yield_tick().await;
            callback()
        })
    }

    /// Always fails: synchronous cross-context execution would let a
    /// continuation run inside its caller's stack frame.
    pub fn send<F: FnOnce()>(&self, _callback: F) -> Result<(), CoroutineError> {
        log::error!("synchronous send is not supported; use schedule instead");
        Err(CoroutineError::SynchronousSend)
    }

    pub fn remote(&self) -> RemoteQueue {
        self.inner.queue.clone()
    }

    /// Runs every continuation that was queued before this call, in FIFO
    /// order. A panic in one continuation is reported through its handle and
    /// does not stop the rest of the batch.
    pub fn pump(&self, context: &TickContext) -> Result<PumpReport, CoroutineError> {
        if self.inner.pumping.replace(true) {
            return Err(CoroutineError::ReentrantPump);
        }
        let _guard = PumpGuard(&self.inner.pumping);
        self.inner.tick.set(context.tick);

        let batch = self.inner.queue.take_batch();
        let mut report = PumpReport::default();

        for continuation in batch {
            match continuation {
                Continuation::Resume(id) => {
                    let task = self.inner.tasks.borrow_mut().remove(&id);
                    let Some(task) = task else {
                        // Finished or faulted after the wake was queued.
                        continue;
                    };
                    report.executed += 1;
                    match self.poll_task(id, task) {
                        PollOutcome::Completed => report.completed += 1,
                        PollOutcome::Faulted => report.faulted += 1,
                        PollOutcome::Suspended => {}
                    }
                }
                Continuation::Callback(callback) => {
                    report.executed += 1;
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
                        log::error!(
                            "scheduled callback panicked at tick {}: {}",
                            context.tick,
                            panic_message(payload.as_ref())
                        );
                        report.faulted += 1;
                    }
                }
            }
        }

        if report.faulted > 0 {
            log::warn!(
                "tick {}: {} of {} continuations faulted",
                context.tick,
                report.faulted,
                report.executed
            );
        }
        Ok(report)
    }

    /// Tick of the most recent pump.
    pub fn current_tick(&self) -> u32 {
        self.inner.tick.get()
    }

    /// Continuations waiting for the next pump.
    pub fn pending(&self) -> usize {
        self.inner.queue.pending()
    }

    /// Coroutines that are suspended and not yet finished.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    fn poll_task(&self, id: TaskId, mut task: LocalTask) -> PollOutcome {
        let waker = task.waker.clone();
        let mut cx = Context::from_waker(&waker);
        let result = catch_unwind(AssertUnwindSafe(|| task.future.as_mut().poll(&mut cx)));

        match result {
            Ok(Poll::Pending) => {
                self.inner.tasks.borrow_mut().insert(id, task);
                PollOutcome::Suspended
            }
            Ok(Poll::Ready(())) => {
                task.fail = None;
                log::trace!("coroutine {id} completed");
                PollOutcome::Completed
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("coroutine {id} panicked: {message}");
                if let Some(fail) = task.fail.take() {
                    fail(CoroutineError::Panicked(message));
                }
                PollOutcome::Faulted
            }
        }
    }
}

impl std::fmt::Debug for CoroutineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineScheduler")
            .field("tick", &self.current_tick())
            .field("tasks", &self.task_count())
            .field("pending", &self.pending())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::sleep_ticks;

    fn ctx(tick: u32) -> TickContext {
        TickContext::new(tick, 1.0 / 60.0)
    }

    #[test]
    fn run_polls_until_first_suspension() {
        let scheduler = CoroutineScheduler::new();
        let trace = Rc::new(RefCell::new(Vec::new()));

        let t = Rc::clone(&trace);
        let handle = scheduler.run(async move {
            t.borrow_mut().push("start");
            yield_tick().await;
            t.borrow_mut().push("resumed");
            5
        });

        assert_eq!(*trace.borrow(), vec!["start"]);
        assert!(!handle.is_finished());
        assert_eq!(scheduler.task_count(), 1);

        scheduler.pump(&ctx(1)).unwrap();

        assert_eq!(*trace.borrow(), vec!["start", "resumed"]);
        assert_eq!(handle.try_take(), Some(Ok(5)));
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn scheduled_callbacks_run_once_in_fifo_order() {
        let scheduler = CoroutineScheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..10 {
            let order = Rc::clone(&order);
            scheduler.schedule(move || order.borrow_mut().push(i));
        }
        assert!(order.borrow().is_empty());

        let report = scheduler.pump(&ctx(1)).unwrap();
        assert_eq!(report.executed, 10);
        assert_eq!(*order.borrow(), (0..10).collect::<Vec<_>>());

        scheduler.pump(&ctx(2)).unwrap();
        assert_eq!(order.borrow().len(), 10);
    }

    #[test]
    fn work_queued_during_pump_waits_for_next_pump() {
        let scheduler = CoroutineScheduler::new();
        let ran = Rc::new(Cell::new(0));

        let inner_scheduler = scheduler.clone();
        let inner_ran = Rc::clone(&ran);
        scheduler.schedule(move || {
            let ran = Rc::clone(&inner_ran);
            inner_scheduler.schedule(move || ran.set(ran.get() + 1));
        });

        scheduler.pump(&ctx(1)).unwrap();
        assert_eq!(ran.get(), 0);
        assert_eq!(scheduler.pending(), 1);

        scheduler.pump(&ctx(2)).unwrap();
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn panic_is_isolated_to_its_handle() {
        let scheduler = CoroutineScheduler::new();
        let after = Rc::new(Cell::new(false));

        let failing = scheduler.schedule(|| -> u32 { panic!("boom") });
        let flag = Rc::clone(&after);
        let next = scheduler.schedule(move || flag.set(true));

        let report = scheduler.pump(&ctx(1)).unwrap();

        assert_eq!(report.faulted, 1);
        assert!(after.get());
        assert_eq!(
            failing.try_take(),
            Some(Err(CoroutineError::Panicked("boom".to_string())))
        );
        assert_eq!(next.try_take(), Some(Ok(())));
    }

    #[test]
    fn remote_callbacks_run_on_pump() {
        let scheduler = CoroutineScheduler::new();
        let remote = scheduler.remote();
        let hits = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&hits);
        std::thread::spawn(move || {
            remote.schedule(move || *counter.lock().unwrap() += 1);
        })
        .join()
        .unwrap();

        assert_eq!(*hits.lock().unwrap(), 0);
        scheduler.pump(&ctx(1)).unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn send_always_fails() {
        let scheduler = CoroutineScheduler::new();
        assert_eq!(scheduler.send(|| {}), Err(CoroutineError::SynchronousSend));
        assert_eq!(
            scheduler.remote().send(|| {}),
            Err(CoroutineError::SynchronousSend)
        );
    }

    #[test]
    fn pump_from_inside_pump_is_rejected() {
        let scheduler = CoroutineScheduler::new();
        let inner = scheduler.clone();
        let nested = scheduler.schedule(move || inner.pump(&ctx(1)).map(|_| ()));

        scheduler.pump(&ctx(1)).unwrap();
        assert_eq!(nested.try_take(), Some(Ok(Err(CoroutineError::ReentrantPump))));

        // The guard is released once the outer pump returns.
        assert!(scheduler.pump(&ctx(2)).is_ok());
    }

    #[test]
    fn coroutines_can_await_each_other() {
        let scheduler = CoroutineScheduler::new();

        let producer = scheduler.run(async {
            sleep_ticks(3).await;
            21
        });
        let consumer = scheduler.run(async move { producer.await.map(|v| v * 2) });

        for tick in 1..=5 {
            scheduler.pump(&ctx(tick)).unwrap();
        }
        assert_eq!(consumer.try_take(), Some(Ok(Ok(42))));
    }

    #[test]
    fn dropping_scheduler_abandons_suspended_tasks() {
        let scheduler = CoroutineScheduler::new();
        let handle = scheduler.run(async {
            sleep_ticks(10).await;
        });

        drop(scheduler);
        assert_eq!(handle.try_take(), Some(Err(CoroutineError::Abandoned)));
    }
}
