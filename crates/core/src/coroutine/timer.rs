use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Suspends the current coroutine until the next scheduler pump.
pub fn yield_tick() -> SleepTicks {
    sleep_ticks(1)
}

/// Suspends the current coroutine for `ticks` scheduler pumps.
/// `sleep_ticks(0)` completes without suspending.
pub fn sleep_ticks(ticks: u32) -> SleepTicks {
    SleepTicks { remaining: ticks }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct SleepTicks {
    remaining: u32,
}

impl Future for SleepTicks {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.remaining == 0 {
            return Poll::Ready(());
        }
        self.remaining -= 1;
        // Each poll happens in a separate pump, so one self-wake per tick.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
