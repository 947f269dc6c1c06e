//! Execution contexts
//!
//! The sweep touches arbitrary application objects, which is only safe where
//! the host itself mutates them. The engine therefore hands that work to a
//! [`MainContext`] instead of running it on the injection queue.

use crossbeam::channel::{unbounded, Receiver, Sender};

/// Work handed to a context
pub type Task = Box<dyn FnOnce() + Send>;

/// Serialized context where the host mutates its own state
pub trait MainContext: Send + Sync {
    /// Schedule `task`
    fn dispatch(&self, task: Task);
}

/// Runs tasks on the dispatching thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateContext;

impl MainContext for ImmediateContext {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Tasks wait until the host's run loop calls [`MainThreadQueue::run_pending`]
pub struct MainThreadQueue {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
}

impl MainThreadQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Run every queued task on the calling thread. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            count += 1;
        }
        count
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContext for MainThreadQueue {
    fn dispatch(&self, task: Task) {
        // The queue owns its receiver, so the channel cannot be disconnected.
        let _ = self.sender.send(task);
    }
}
