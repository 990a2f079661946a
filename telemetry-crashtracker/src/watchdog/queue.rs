// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

pub type Probe = Box<dyn FnOnce() + Send + 'static>;

/// The work queue the main thread is expected to keep draining.
pub trait WorkQueue: Send + Sync {
    /// Enqueues `probe`. Returns false if the queue no longer accepts work.
    fn post(&self, probe: Probe) -> bool;
}

/// Creates a queue and the loop that drains it. The [`MainLoop`] belongs on the main thread.
pub fn channel() -> (ChannelQueue, MainLoop) {
    let (sender, receiver) = mpsc::channel();
    (ChannelQueue { sender }, MainLoop { receiver })
}

#[derive(Debug, Clone)]
pub struct ChannelQueue {
    sender: mpsc::Sender<Probe>,
}

impl WorkQueue for ChannelQueue {
    fn post(&self, probe: Probe) -> bool {
        self.sender.send(probe).is_ok()
    }
}

#[derive(Debug)]
pub struct MainLoop {
    receiver: mpsc::Receiver<Probe>,
}

impl MainLoop {
    /// Runs everything already queued. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Waits up to `timeout` for one job and runs it. Returns whether a job ran.
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Runs jobs until every [`ChannelQueue`] is dropped.
    pub fn run(&self) {
        while let Ok(job) = self.receiver.recv() {
            job();
        }
    }
}

/// Posts probes as tasks on a tokio runtime, for hosts whose "main thread" is their runtime.
#[derive(Debug, Clone)]
pub struct TokioQueue {
    handle: tokio::runtime::Handle,
}

impl TokioQueue {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Queue for the runtime the caller is running on. Panics outside of a runtime, like
    /// `Handle::current`.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl WorkQueue for TokioQueue {
    fn post(&self, probe: Probe) -> bool {
        self.handle.spawn(async move { probe() });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_channel_queue_runs_in_order() {
        let (queue, main_loop) = channel();
        let seen = Arc::new(std::sync::Mutex::new(vec![]));
        for i in 0..3 {
            let seen = seen.clone();
            assert!(queue.post(Box::new(move || seen.lock().unwrap().push(i))));
        }
        assert_eq!(main_loop.run_pending(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert!(!main_loop.run_one(Duration::from_millis(1)));

        drop(main_loop);
        assert!(!queue.post(Box::new(|| {})));
    }

    #[tokio::test]
    async fn test_tokio_queue() {
        let ran = Arc::new(AtomicUsize::new(0));
        let queue = TokioQueue::current();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let counter = ran.clone();
        assert!(queue.post(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        })));
        done_rx.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
