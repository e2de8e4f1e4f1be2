//! Dispatcher threads, component threads and timers

pub mod component_thread;
pub mod dispatcher_thread;
pub mod state;
pub mod timer;

pub use component_thread::ComponentThread;
pub use dispatcher_thread::{DispatcherThread, IdleBody, ThreadBody};
pub use state::{StateCell, ThreadState};
pub use timer::{Timer, TimerRepeat, TimerTick};
