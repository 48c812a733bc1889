// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Single shot reply futures.
//!
//! The engine resolves these from its worker thread. A caller can either
//! `.await` them or block on them with a deadline. When the resolving side is
//! dropped without a reply (the engine shut down first) the future simply
//! never resolves.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

struct ReplyState<T> {
    reply: Option<T>,
    waker: Option<Waker>,
}

impl<T> ReplyState<T> {
    fn set_reply(&mut self, reply: T) {
        self.reply = Some(reply);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

type Shared<T> = Arc<(Mutex<ReplyState<T>>, Condvar)>;

/// Creates a connected responder/future pair.
pub fn reply_channel<T>() -> (Responder<T>, ReplyFuture<T>) {
    let shared: Shared<T> = Arc::new((
        Mutex::new(ReplyState {
            reply: None,
            waker: None,
        }),
        Condvar::new(),
    ));
    (
        Responder {
            shared: shared.clone(),
        },
        ReplyFuture { shared },
    )
}

/// The resolving half. Consumed by [`Responder::resolve`], so a reply is
/// delivered at most once.
pub struct Responder<T> {
    shared: Shared<T>,
}

impl<T> Responder<T> {
    pub fn resolve(self, reply: T) {
        let (lock, cvar) = &*self.shared;
        lock.lock().unwrap().set_reply(reply);
        cvar.notify_all();
    }
}

impl<T> std::fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("Responder")
    }
}

/// The waiting half.
pub struct ReplyFuture<T> {
    shared: Shared<T>,
}

impl<T> ReplyFuture<T> {
    /// Takes the reply if it has arrived.
    pub fn try_take(&mut self) -> Option<T> {
        self.shared.0.lock().unwrap().reply.take()
    }

    /// Blocks the calling thread until the reply arrives or `timeout`
    /// elapses. Must not be called from the engine's own callbacks.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        loop {
            if let Some(reply) = state.reply.take() {
                return Some(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = cvar.wait_timeout(state, deadline - now).unwrap().0;
        }
    }
}

impl<T> Future for ReplyFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.0.lock().unwrap();
        match state.reply.take() {
            Some(reply) => Poll::Ready(reply),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> std::fmt::Debug for ReplyFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("ReplyFuture")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolves_across_threads() {
        let (responder, mut future) = reply_channel();
        let worker = thread::spawn(move || responder.resolve(42u8));
        assert_eq!(future.wait_timeout(Duration::from_secs(5)), Some(42));
        worker.join().unwrap();
    }

    #[test]
    fn dropped_responder_never_resolves() {
        let (responder, mut future) = reply_channel::<u8>();
        drop(responder);
        assert_eq!(future.wait_timeout(Duration::from_millis(20)), None);
        assert_eq!(future.try_take(), None);
    }

    #[tokio::test]
    async fn can_be_awaited() {
        let (responder, future) = reply_channel();
        tokio::spawn(async move { responder.resolve("done") });
        assert_eq!(future.await, "done");
    }
}
