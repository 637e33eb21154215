use std::fmt::Debug;
use std::time::SystemTime;

/// Wall-clock seam. Everything that needs the current time receives an
/// `Arc<dyn Clock>` at construction so tests can freeze or step time.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
