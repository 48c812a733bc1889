// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! One shot, re-armable alarms.
//!
//! Callbacks run on a dedicated timer thread, never on the engine's worker.

use log::{trace, warn};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::{self, Handle};
use tokio::sync::oneshot;
use tokio::task;

/// Owns the timer thread. Dropping the service cancels every alarm created
/// from it.
pub struct TimerService {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TimerService {
    pub fn new(name: &str) -> std::io::Result<TimerService> {
        let runtime = runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        let (stop, stopped) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                runtime.block_on(async {
                    // resolves on an explicit stop or when the sender is dropped
                    let _ = stopped.await;
                });
            })?;

        Ok(TimerService {
            handle,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn alarm(&self, name: &'static str) -> Alarm {
        Alarm {
            name,
            handle: self.handle.clone(),
            pending: Mutex::new(None),
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
    }
}

pub struct Alarm {
    name: &'static str,
    handle: Handle,
    pending: Mutex<Option<task::JoinHandle<()>>>,
}

impl Alarm {
    /// Schedules `callback` to run once after `after`, replacing whatever was
    /// scheduled before.
    pub fn set<F>(&self, after: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("Setting alarm {} for {:?}", self.name, after);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            callback();
        });
        if let Some(previous) = self.pending.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    /// A callback that is already running is not interrupted.
    pub fn cancel(&self) {
        if let Some(task) = self.pending.lock().unwrap().take() {
            trace!("Cancelling alarm {}", self.name);
            task.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

impl std::fmt::Debug for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Alarm")
            .field("name", &self.name)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}
