use std::sync::Arc;

use metrics::gauge;
use tokio::sync::watch;

/// In-flight count plus the number of times it has drained to zero. A waiter
/// that remembers the drain count cannot miss a zero that was immediately
/// followed by new work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Drain {
    pending: usize,
    drained: u64,
}

/// Counter of dispatched-but-unfinished notifications.
#[derive(Debug)]
pub(crate) struct InFlight {
    state: watch::Sender<Drain>,
}

impl InFlight {
    pub(crate) fn new() -> Arc<Self> {
        let (state, _rx) = watch::channel(Drain::default());
        Arc::new(Self { state })
    }

    /// Count one notification until the returned guard is dropped.
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.state.send_modify(|s| s.pending += 1);
        gauge!("roster_pool_in_flight", self.current() as f64);
        InFlightGuard(Arc::clone(self))
    }

    pub(crate) fn current(&self) -> usize { self.state.borrow().pending }

    pub(crate) fn wait_blocking(&self) {
        let (mut rx, start) = self.watch();
        if start.pending == 0 {
            return;
        }
        let _ = futures::executor::block_on(rx.wait_for(|s| drained_since(start, s)));
    }

    pub(crate) async fn settled(&self) {
        let (mut rx, start) = self.watch();
        if start.pending == 0 {
            return;
        }
        let _ = rx.wait_for(|s| drained_since(start, s)).await;
    }

    fn watch(&self) -> (watch::Receiver<Drain>, Drain) {
        let mut rx = self.state.subscribe();
        let start = *rx.borrow_and_update();
        (rx, start)
    }

    fn leave(&self) {
        self.state.send_modify(|s| {
            s.pending = s.pending.saturating_sub(1);
            if s.pending == 0 {
                s.drained = s.drained.wrapping_add(1);
            }
        });
        gauge!("roster_pool_in_flight", self.current() as f64);
    }
}

fn drained_since(start: Drain, now: &Drain) -> bool { now.pending == 0 || now.drained != start.drained }

pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) { self.0.leave() }
}
