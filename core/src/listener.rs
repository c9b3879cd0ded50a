use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::ErrorCode;

/// Observer of one mission. Every callback has a no-op default.
pub trait MissionListener: Send + Sync {
    fn on_init(&self) {}
    fn on_start(&self) {}
    fn on_pause(&self) {}
    fn on_waiting(&self) {}
    fn on_progress_update(&self, _done: u64, _total: u64) {}
    fn on_finish(&self) {}
    fn on_error(&self, _code: ErrorCode) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionEvent {
    Init,
    Start,
    Pause,
    Waiting,
    Progress { done: u64, total: u64 },
    Finish,
    Error(ErrorCode),
}

impl MissionEvent {
    pub fn deliver(&self, listener: &dyn MissionListener) {
        match *self {
            MissionEvent::Init => listener.on_init(),
            MissionEvent::Start => listener.on_start(),
            MissionEvent::Pause => listener.on_pause(),
            MissionEvent::Waiting => listener.on_waiting(),
            MissionEvent::Progress { done, total } => listener.on_progress_update(done, total),
            MissionEvent::Finish => listener.on_finish(),
            MissionEvent::Error(code) => listener.on_error(code),
        }
    }
}

pub type Job = Box<dyn FnOnce() + Send>;

/// Execution context a listener's callbacks are delivered on.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs callbacks on whichever thread emitted the event.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Posts callbacks to a [`CallbackQueue`] drained by the consumer's own thread.
pub struct QueueExecutor {
    tx: Sender<Job>,
}

pub struct CallbackQueue {
    rx: Receiver<Job>,
}

impl QueueExecutor {
    pub fn new() -> (Arc<QueueExecutor>, CallbackQueue) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(QueueExecutor { tx }), CallbackQueue { rx })
    }
}

impl Executor for QueueExecutor {
    fn execute(&self, job: Job) {
        // The consumer dropped its queue; nobody is left to observe the event.
        let _ = self.tx.send(job);
    }
}

impl CallbackQueue {
    /// Run every callback queued so far. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0usize;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one callback and run it.
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct Entry {
    handle: ListenerHandle,
    listener: Weak<dyn MissionListener>,
    executor: Arc<dyn Executor>,
}

/// Weakly held listeners paired with their delivery context. The owner of a
/// listener detaches it through its [`ListenerHandle`]; entries whose listener
/// was dropped are pruned on the next dispatch.
#[derive(Default)]
pub struct ListenerRegistry {
    next: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl ListenerRegistry {
    pub fn add(
        &self,
        listener: &Arc<dyn MissionListener>,
        executor: Arc<dyn Executor>,
    ) -> ListenerHandle {
        let handle = ListenerHandle(self.next.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(Entry {
                handle,
                listener: Arc::downgrade(listener),
                executor,
            });
        }
        handle
    }

    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.handle != handle);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, event: MissionEvent) {
        let targets: Vec<(Weak<dyn MissionListener>, Arc<dyn Executor>)> = {
            let Ok(mut entries) = self.entries.lock() else {
                return;
            };
            entries.retain(|entry| entry.listener.strong_count() > 0);
            entries
                .iter()
                .map(|entry| (entry.listener.clone(), Arc::clone(&entry.executor)))
                .collect()
        };
        for (listener, executor) in targets {
            executor.execute(Box::new(move || {
                if let Some(listener) = listener.upgrade() {
                    event.deliver(listener.as_ref());
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<MissionEvent>>,
    }

    impl MissionListener for Recorder {
        fn on_start(&self) {
            self.events.lock().unwrap().push(MissionEvent::Start);
        }
        fn on_progress_update(&self, done: u64, total: u64) {
            self.events
                .lock()
                .unwrap()
                .push(MissionEvent::Progress { done, total });
        }
    }

    #[test]
    fn inline_delivery_and_explicit_removal() {
        let registry = ListenerRegistry::default();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn MissionListener> = recorder.clone();
        let handle = registry.add(&listener, Arc::new(InlineExecutor));

        registry.dispatch(MissionEvent::Start);
        assert!(registry.remove(handle));
        registry.dispatch(MissionEvent::Start);

        assert_eq!(*recorder.events.lock().unwrap(), vec![MissionEvent::Start]);
        assert!(!registry.remove(handle));
    }

    #[test]
    fn queued_delivery_runs_on_the_draining_thread() {
        let registry = ListenerRegistry::default();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn MissionListener> = recorder.clone();
        let (executor, queue) = QueueExecutor::new();
        registry.add(&listener, executor);

        registry.dispatch(MissionEvent::Progress { done: 10, total: 20 });
        assert!(recorder.events.lock().unwrap().is_empty());

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![MissionEvent::Progress { done: 10, total: 20 }]
        );
    }

    #[test]
    fn registry_does_not_keep_listeners_alive() {
        let registry = ListenerRegistry::default();
        let listener: Arc<dyn MissionListener> = Arc::new(Recorder::default());
        registry.add(&listener, Arc::new(InlineExecutor));
        assert_eq!(registry.len(), 1);

        drop(listener);
        registry.dispatch(MissionEvent::Start);
        assert!(registry.is_empty());
    }
}
