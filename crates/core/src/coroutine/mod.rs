mod handle;
mod scheduler;
mod timer;

pub use handle::CoroutineHandle;
pub use scheduler::{CoroutineScheduler, PumpReport, RemoteQueue, TaskId, TickContext};
pub use timer::{SleepTicks, sleep_ticks, yield_tick};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoroutineError {
    #[error("coroutine panicked: {0}")]
    Panicked(String),
    #[error("coroutine was dropped before it finished")]
    Abandoned,
    #[error("coroutine result was already taken")]
    AlreadyTaken,
    #[error("synchronous send is not supported")]
    SynchronousSend,
    #[error("scheduler pump called from inside a pump")]
    ReentrantPump,
}
