use std::sync::Arc;
use tokio::sync::watch;

/// One-shot completion signal shared by every caller coalesced onto a batch.
///
/// The batcher owns the `Done` and closes it exactly once when the batch
/// settles; waiters hold [`DoneHandle`]s. Dropping an unclosed `Done` (for
/// example when the flush task panics) unblocks waiters the same way a close
/// does, so nobody is ever stuck.
pub struct Done {
    tx: watch::Sender<bool>,
    token: Arc<()>,
}

impl Done {
    pub fn new() -> Done {
        let (tx, _rx) = watch::channel(false);
        Done { tx, token: Arc::new(()) }
    }

    pub fn handle(&self) -> DoneHandle {
        DoneHandle {
            rx: self.tx.subscribe(),
            token: Arc::clone(&self.token),
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for Done {
    fn default() -> Done {
        Done::new()
    }
}

pub struct DoneHandle {
    rx: watch::Receiver<bool>,
    token: Arc<()>,
}

impl DoneHandle {
    /// Resolves once the signal is closed. A handle subscribed after the
    /// close resolves immediately.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    fn same_signal(&self, other: &DoneHandle) -> bool {
        Arc::ptr_eq(&self.token, &other.token)
    }
}

/// Join primitive for a caller blocking on N flushes. Adding two handles of
/// the same signal keeps only one.
#[derive(Default)]
pub struct WaitSet {
    handles: Vec<DoneHandle>,
}

impl WaitSet {
    pub fn new() -> WaitSet {
        WaitSet::default()
    }

    pub fn add(&mut self, handle: DoneHandle) {
        if !self.handles.iter().any(|h| h.same_signal(&handle)) {
            self.handles.push(handle);
        }
    }

    pub async fn wait(self) {
        for handle in self.handles {
            handle.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn wait_blocks_until_every_signal_closes() {
        let one = Done::new();
        let two = Done::new();

        let mut set = WaitSet::new();
        set.add(one.handle());
        set.add(one.handle());
        set.add(two.handle());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            one.close();
            tokio::time::sleep(Duration::from_millis(10)).await;
            two.close();
        });

        let start = Instant::now();
        set.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn handle_after_close_resolves_immediately() {
        let done = Done::new();
        done.close();
        done.handle().wait().await;
    }

    #[tokio::test]
    async fn dropped_signal_unblocks_waiters() {
        let done = Done::new();
        let handle = done.handle();
        drop(done);
        handle.wait().await;
    }
}
