//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use derive_new::new;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task;
use tokio::time::Instant;
use tracing::Instrument;

// Jitter bounds (RFC 5880 §6.8.7): the armed transmit interval is picked
// uniformly from [75%, 75% + max_jitter%] of the nominal value. A detect_mult
// of 1 narrows the upper bound to 90% so that three packets in a row are
// never required to all be late for the peer to miss a full detection
// interval.
const JITTER_MAX_DETECT_MULT_ONE: u32 = 16;
const JITTER_MAX_DEFAULT: u32 = 26;

// Returns a jittered version of `nominal` (in microseconds), per §4.C.
//
// `nominal` is expected to already be the negotiated interval (the greater
// of the local and remote advertised values); this function only applies
// the random jitter factor.
pub fn jittered_interval(
    nominal: u32,
    local_detect_mult: u8,
    rng: &mut impl Rng,
) -> u32 {
    let max_jitter = if local_detect_mult == 1 {
        JITTER_MAX_DETECT_MULT_ONE
    } else {
        JITTER_MAX_DEFAULT
    };
    let pct = 75 + rng.random_range(0..max_jitter);
    ((nominal as u64) * (pct as u64) / 100) as u32
}

/// A handle which can be used to manipulate the task created by
/// [`Task::spawn`].
///
/// By default, dropping this handle cancels the task.
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
    detached: bool,
}

impl<T> Task<T> {
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
            detached: false,
        }
    }

    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join_handle.abort();
        }
    }
}

#[derive(Debug)]
enum Message {
    Reset(Duration),
}

/// A handle which can be used to cancel or rearm the interval task created by
/// [`IntervalTask::new`].
///
/// Dropping this handle cancels the interval task.
#[derive(Debug)]
pub struct IntervalTask {
    #[cfg(not(feature = "testing"))]
    inner: IntervalTaskInner,
}

#[derive(Debug, new)]
struct IntervalTaskInner {
    _task: Task<()>,
    control: UnboundedSender<Message>,
    next: Arc<Mutex<Instant>>,
}

impl IntervalTask {
    /// Spawns a task that invokes `cb` every time `interval` elapses. If
    /// `immediate` is set, `cb` also fires once right away before the first
    /// full interval.
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(interval: Duration, immediate: bool, cb: F) -> IntervalTask
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let next = Instant::now() + interval;
        let next = Arc::new(Mutex::new(next));
        let next_child = next.clone();

        let task = Task::spawn(
            async move {
                let mut interval = interval;
                if immediate {
                    (cb)().await;
                }

                loop {
                    let sleep = tokio::time::sleep(interval);
                    tokio::pin!(sleep);

                    tokio::select! {
                        _ = &mut sleep => {
                            (cb)().await;
                            let mut next = next_child.lock().unwrap();
                            *next = Instant::now() + interval;
                        }
                        message = control_rx.recv() => {
                            match message {
                                Some(Message::Reset(new_interval)) => {
                                    interval = new_interval;
                                    let mut next = next_child.lock().unwrap();
                                    *next = Instant::now() + interval;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        IntervalTask {
            inner: IntervalTaskInner::new(task, control_tx, next),
        }
    }

    #[cfg(feature = "testing")]
    pub fn new<F, Fut>(
        _interval: Duration,
        _immediate: bool,
        _cb: F,
    ) -> IntervalTask
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        IntervalTask {}
    }

    /// Reschedules the task to fire every `interval` from now on.
    #[cfg(not(feature = "testing"))]
    pub fn reset(&mut self, interval: Duration) {
        let _ = self.inner.control.send(Message::Reset(interval));
    }

    #[cfg(feature = "testing")]
    pub fn reset(&mut self, _interval: Duration) {}
}

/// A handle which can be used to cancel the timeout task created by
/// [`TimeoutTask::new`].
///
/// Dropping this handle cancels the timeout.
#[derive(Debug)]
pub struct TimeoutTask {
    #[cfg(not(feature = "testing"))]
    inner: TimeoutTaskInner,
}

#[derive(Debug, new)]
struct TimeoutTaskInner {
    _task: Task<()>,
}

impl TimeoutTask {
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task = Task::spawn(
            async move {
                tokio::time::sleep(timeout).await;
                (cb)().await;
            }
            .in_current_span(),
        );

        TimeoutTask {
            inner: TimeoutTaskInner::new(task),
        }
    }

    #[cfg(feature = "testing")]
    pub fn new<F, Fut>(_timeout: Duration, _cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        TimeoutTask {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds_detect_mult_three() {
        let mut rng = rand::rng();
        for _ in 0..10_000 {
            let v = jittered_interval(1_000_000, 3, &mut rng);
            assert!((750_000..=1_000_000).contains(&v), "{v} out of bounds");
        }
    }

    #[test]
    fn jitter_stays_within_bounds_detect_mult_one() {
        let mut rng = rand::rng();
        for _ in 0..10_000 {
            let v = jittered_interval(1_000_000, 1, &mut rng);
            assert!((750_000..=900_000).contains(&v), "{v} out of bounds");
        }
    }
}
