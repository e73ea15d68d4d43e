//! Change poller for one parameter of one process
//!
//! Shared memory cannot wake anyone up, so a background thread samples the
//! parameter at a fixed interval and turns the samples into edge-triggered
//! [`PollEvent`]s. Events are handed to the consumer through a channel (or a
//! callback running on a dispatcher thread), so a slow consumer never delays
//! the sampling loop.
//!
//! ```text
//!            success / Initial+Changed
//!   Invalid ---------------------------> Valid --+ success, value differs / Changed
//!      ^                                   |  ^--+
//!      +---------- failure / Invalid ------+
//! ```
//!
//! The poller starts in `Invalid` without emitting anything.

use crate::error::ProcStateResult;
use crate::procstate_internal;
use crate::registry::ProcessHandle;
use crossbeam::channel::{self, bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Notification emitted by a [`ChangePoller`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// First successful read after being invalid
    Initial(Vec<u8>),
    /// Value differs from the last one seen (also follows every `Initial`)
    Changed(Vec<u8>),
    /// Parameter unreadable or heartbeat too old; sent once per outage
    Invalid,
}

/// Liveness state of the polled parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Invalid,
    Valid,
}

/// Turns a sequence of samples into edge-triggered events
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    state: PollState,
    last: Option<Vec<u8>>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self {
            state: PollState::Invalid,
            last: None,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Feed one sample; `None` is a failed read.
    pub fn observe(&mut self, sample: Option<Vec<u8>>) -> Vec<PollEvent> {
        match (self.state, sample) {
            (PollState::Invalid, Some(value)) => {
                self.state = PollState::Valid;
                self.last = Some(value.clone());
                vec![PollEvent::Initial(value.clone()), PollEvent::Changed(value)]
            }
            (PollState::Valid, Some(value)) => {
                if self.last.as_ref() == Some(&value) {
                    return Vec::new();
                }
                self.last = Some(value.clone());
                vec![PollEvent::Changed(value)]
            }
            (PollState::Valid, None) => {
                self.state = PollState::Invalid;
                self.last = None;
                vec![PollEvent::Invalid]
            }
            (PollState::Invalid, None) => Vec::new(),
        }
    }
}

/// Sampling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between two samples
    pub interval: Duration,
    /// Treat the read as failed when the owner's heartbeat is older than this
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            heartbeat_timeout: None,
        }
    }
}

impl PollerConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            heartbeat_timeout: None,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

/// One sample: the value, or `None` if unreadable or the owner looks dead.
fn sample(handle: &ProcessHandle, key: &str, heartbeat_timeout: Option<Duration>) -> Option<Vec<u8>> {
    if let Some(timeout) = heartbeat_timeout {
        match handle.heartbeat_age() {
            Ok(age) if age <= timeout => {}
            Ok(age) => {
                log::trace!("({}) heartbeat age {:?} exceeds {:?}", handle.name(), age, timeout);
                return None;
            }
            Err(e) => {
                log::trace!("({}) no heartbeat: {}", handle.name(), e);
                return None;
            }
        }
    }

    match handle.get_parameter(key) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("({}) could not read '{}': {}", handle.name(), key, e);
            None
        }
    }
}

/// Background poller over one parameter
///
/// Stopping is cooperative: once [`stop`](Self::stop) returns no further event
/// is delivered, and the sampling thread exits within one interval. Dropping
/// the poller stops and joins it.
pub struct ChangePoller {
    key: String,
    running: Arc<AtomicBool>,
    /// Held across the running check and the delivery of one event
    delivery: Arc<Mutex<()>>,
    stop_tx: Sender<()>,
    events: Receiver<PollEvent>,
    worker: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ChangePoller {
    /// Poll `key` of `handle` every `interval`.
    pub fn new(
        handle: ProcessHandle,
        key: &str,
        interval: Duration,
        heartbeat_timeout: Option<Duration>,
    ) -> ProcStateResult<Self> {
        Self::spawn(
            handle,
            key,
            PollerConfig {
                interval,
                heartbeat_timeout,
            },
        )
    }

    /// Start polling; events are read from [`events`](Self::events).
    pub fn spawn(handle: ProcessHandle, key: &str, config: PollerConfig) -> ProcStateResult<Self> {
        let (event_tx, event_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let running = Arc::new(AtomicBool::new(true));
        let delivery = Arc::new(Mutex::new(()));

        let worker = {
            let running = Arc::clone(&running);
            let delivery = Arc::clone(&delivery);
            let key = key.to_string();
            thread::Builder::new()
                .name(format!("procstate-poll-{}", handle.name()))
                .spawn(move || {
                    let mut detector = ChangeDetector::new();
                    'poll: while running.load(Ordering::Acquire) {
                        let value = sample(&handle, &key, config.heartbeat_timeout);
                        for event in detector.observe(value) {
                            let _delivering = delivery.lock();
                            if !running.load(Ordering::Acquire) {
                                break 'poll;
                            }
                            log::debug!("({}) '{}': {:?}", handle.name(), key, event);
                            if event_tx.send(event).is_err() {
                                break 'poll;
                            }
                        }

                        match stop_rx.recv_timeout(config.interval) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    log::trace!("({}) poller for '{}' stopped", handle.name(), key);
                })
                .map_err(|e| procstate_internal!("Failed to spawn poller thread: {}", e))?
        };

        Ok(Self {
            key: key.to_string(),
            running,
            delivery,
            stop_tx,
            events: event_rx,
            worker: Some(worker),
            dispatcher: None,
        })
    }

    /// Start polling and invoke `callback` for every event on a dispatcher thread.
    pub fn with_callback<F>(
        handle: ProcessHandle,
        key: &str,
        config: PollerConfig,
        mut callback: F,
    ) -> ProcStateResult<Self>
    where
        F: FnMut(PollEvent) + Send + 'static,
    {
        let mut poller = Self::spawn(handle, key, config)?;
        let events = std::mem::replace(&mut poller.events, channel::never());
        let running = Arc::clone(&poller.running);
        let delivery = Arc::clone(&poller.delivery);

        let dispatcher = thread::Builder::new()
            .name(format!("procstate-dispatch-{}", key))
            .spawn(move || {
                for event in events.iter() {
                    let _delivering = delivery.lock();
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    callback(event);
                }
            })
            .map_err(|e| procstate_internal!("Failed to spawn dispatcher thread: {}", e))?;

        poller.dispatcher = Some(dispatcher);
        Ok(poller)
    }

    /// Event stream; empty when a callback consumes the events
    pub fn events(&self) -> &Receiver<PollEvent> {
        &self.events
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Request termination. Safe to call from any thread, including the callback.
    ///
    /// Waits for an event that is being delivered right now; nothing is
    /// delivered after this returns.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.stop_tx.try_send(());
        // the callback itself holds the delivery lock
        if !self.on_dispatcher_thread() {
            drop(self.delivery.lock());
        }
    }

    fn on_dispatcher_thread(&self) -> bool {
        self.dispatcher
            .as_ref()
            .is_some_and(|d| d.thread().id() == thread::current().id())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for ChangePoller {
    fn drop(&mut self) {
        self.stop();
        let me = thread::current().id();
        for handle in [self.worker.take(), self.dispatcher.take()].into_iter().flatten() {
            if handle.thread().id() != me && handle.join().is_err() {
                log::error!("poller thread for '{}' panicked", self.key);
            }
        }
    }
}

impl std::fmt::Debug for ChangePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePoller")
            .field("key", &self.key)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
