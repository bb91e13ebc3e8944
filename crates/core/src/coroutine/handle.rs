use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use super::CoroutineError;

#[derive(Debug)]
pub(super) struct Slot<T> {
    result: Option<Result<T, CoroutineError>>,
    finished: bool,
    waiters: Vec<Waker>,
}

impl<T> Slot<T> {
    pub(super) fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            result: None,
            finished: false,
            waiters: Vec::new(),
        }))
    }

    pub(super) fn complete(slot: &Rc<RefCell<Self>>, result: Result<T, CoroutineError>) {
        let waiters = {
            let mut slot = slot.borrow_mut();
            if slot.finished {
                return;
            }
            slot.finished = true;
            slot.result = Some(result);
            std::mem::take(&mut slot.waiters)
        };

        // Waking only queues the awaiting coroutine for the next pump.
        for waker in waiters {
            waker.wake();
        }
    }
}

/// Eventual result of a coroutine started with
/// [`CoroutineScheduler::run`](super::CoroutineScheduler::run).
///
/// Other coroutines can `.await` the handle; tick-loop code polls it with
/// [`try_take`](Self::try_take).
#[derive(Debug)]
pub struct CoroutineHandle<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> CoroutineHandle<T> {
    pub(super) fn new(slot: Rc<RefCell<Slot<T>>>) -> Self {
        Self { slot }
    }

    pub fn is_finished(&self) -> bool {
        self.slot.borrow().finished
    }

    /// Takes the result if the coroutine has finished. Returns `None` while it
    /// is still suspended or once the result has already been taken.
    pub fn try_take(&self) -> Option<Result<T, CoroutineError>> {
        self.slot.borrow_mut().result.take()
    }
}

impl<T> Future for CoroutineHandle<T> {
    type Output = Result<T, CoroutineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        if let Some(result) = slot.result.take() {
            return Poll::Ready(result);
        }
        if slot.finished {
            return Poll::Ready(Err(CoroutineError::AlreadyTaken));
        }
        slot.waiters.push(cx.waker().clone());
        Poll::Pending
    }
}
