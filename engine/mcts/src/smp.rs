//! Small SMP building blocks: a spinlock, an atomic f64 accumulator and a
//! fixed-size thread pool.
//!
//! These cover the few places where the search needs more than a bare
//! atomic: the spinlock serializes children-vector mutation inside a node,
//! the accumulator carries the eval sums, and the pool runs the search
//! workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Test-and-set spinlock. Held only for a handful of instructions at a
/// time; never across a network call.
pub struct SpinMutex {
    locked: AtomicBool,
}

impl Default for SpinMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinMutex {
    pub const fn new() -> SpinMutex {
        SpinMutex {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self.locked.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        SpinGuard { mutex: self }
    }
}

/// Scoped unlock for [`SpinMutex`].
pub struct SpinGuard<'a> {
    mutex: &'a SpinMutex,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

/// An f64 with atomic add, built on a compare-exchange loop over the bit
/// representation.
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> AtomicF64 {
        AtomicF64 {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn add(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let new = (f64::from_bits(current) + delta).to_bits();
            match self.bits.compare_exchange_weak(
                current,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle for one submitted task.
pub struct TaskHandle {
    done: Receiver<()>,
}

impl TaskHandle {
    /// Block until the task has run. A worker that panicked counts as
    /// finished.
    pub fn wait(self) {
        let _ = self.done.recv();
    }
}

/// Fixed set of workers draining a shared task queue. Tasks are
/// independent; there is no work stealing.
pub struct ThreadGroup {
    workers: Vec<JoinHandle<()>>,
    sender: Option<Sender<(Task, Sender<()>)>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl ThreadGroup {
    pub fn new(threads: usize) -> ThreadGroup {
        assert!(threads > 0);
        let (sender, receiver) = channel::<(Task, Sender<()>)>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let receiver = Arc::clone(&receiver);
            let pending = Arc::clone(&pending);
            workers.push(std::thread::spawn(move || loop {
                let next = receiver.lock().unwrap().recv();
                let (task, done) = match next {
                    Ok(pair) => pair,
                    Err(_) => break, // queue hung up
                };
                task();
                let _ = done.send(());
                let (count, condvar) = &*pending;
                *count.lock().unwrap() -= 1;
                condvar.notify_all();
            }));
        }

        ThreadGroup {
            workers,
            sender: Some(sender),
            pending,
        }
    }

    /// Queue a task; it starts as soon as a worker is free.
    pub fn add_task<F: FnOnce() + Send + 'static>(&self, task: F) -> TaskHandle {
        let (done_tx, done_rx) = channel();
        {
            let (count, _) = &*self.pending;
            *count.lock().unwrap() += 1;
        }
        self.sender
            .as_ref()
            .expect("thread group already shut down")
            .send((Box::new(task), done_tx))
            .expect("worker threads exited early");
        TaskHandle { done: done_rx }
    }

    /// Block until every queued task has finished.
    pub fn wait_all(&self) {
        let (count, condvar) = &*self.pending;
        let mut count = count.lock().unwrap();
        while *count > 0 {
            count = condvar.wait(count).unwrap();
        }
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        self.sender.take(); // hang up the queue
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
