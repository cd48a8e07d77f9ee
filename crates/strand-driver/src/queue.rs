//! Ordered, capacity-bounded hand-off of command buffers from the client
//! thread to the execution thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use strand_protocol::Command;
use tracing::{debug, error};

/// Commands recorded between two flushes, executed in order.
#[derive(Debug)]
pub struct CommandBuffer {
    pub seq: u64,
    pub commands: Vec<Command>,
}

/// What the execution thread should do next.
#[derive(Debug)]
pub enum Next {
    Buffer(CommandBuffer),
    /// Nothing arrived within the timeout, or the queue is paused.
    Idle,
    /// Exit was requested and every submitted buffer has been handed out.
    Exit,
}

/// Producer side plus the pause/exit controls shared with the consumer.
pub struct CommandBufferQueue {
    sender: Sender<CommandBuffer>,
    depth: usize,
    paused: Mutex<bool>,
    resumed: Condvar,
    exit_requested: AtomicBool,
    high_watermark: AtomicUsize,
}

impl CommandBufferQueue {
    /// Creates the queue and the receiving end owned by the execution thread.
    /// If that thread dies, its receiver goes with it and `submit` fails loudly.
    pub fn new(depth: usize) -> (Arc<Self>, CommandBufferReceiver) {
        let (sender, receiver) = bounded(depth);
        let queue = Arc::new(Self {
            sender,
            depth,
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            exit_requested: AtomicBool::new(false),
            high_watermark: AtomicUsize::new(0),
        });
        let receiver = CommandBufferReceiver {
            receiver,
            queue: queue.clone(),
        };
        (queue, receiver)
    }

    /// Hands a buffer to the execution thread, blocking while the queue is
    /// full. A full queue that is paused can never drain, so that is fatal.
    pub fn submit(&self, buffer: CommandBuffer) {
        if self.is_paused() && self.sender.is_full() {
            error!(
                "command buffer queue is full ({} buffers) while paused",
                self.depth
            );
            panic!("command buffer queue overflow: flushing into a full queue while paused");
        }
        let seq = buffer.seq;
        if self.sender.send(buffer).is_err() {
            error!("execution thread is gone, buffer {} cannot be executed", seq);
            panic!("execution thread terminated");
        }
        let queued = self.sender.len();
        let previous = self.high_watermark.fetch_max(queued, Ordering::Relaxed);
        if queued > previous {
            debug!("command buffer queue high watermark: {}", queued);
        }
    }

    pub fn set_paused(&self, paused: bool) {
        let mut guard = self.paused.lock();
        *guard = paused;
        if !paused {
            self.resumed.notify_all();
        }
        debug!("command buffer queue {}", if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Asks the execution thread to drain what was submitted and stop.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
        self.resumed.notify_all();
    }

    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    /// Buffers currently waiting for the execution thread.
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Most buffers ever waiting at once.
    pub fn high_watermark(&self) -> usize {
        self.high_watermark.load(Ordering::Relaxed)
    }
}

pub struct CommandBufferReceiver {
    receiver: Receiver<CommandBuffer>,
    queue: Arc<CommandBufferQueue>,
}

impl CommandBufferReceiver {
    /// Waits up to `timeout` for the next buffer.
    pub fn next(&self, timeout: Duration) -> Next {
        {
            let mut paused = self.queue.paused.lock();
            if *paused {
                if self.queue.exit_requested.load(Ordering::Acquire) {
                    *paused = false;
                } else {
                    self.queue.resumed.wait_for(&mut paused, timeout);
                    if *paused {
                        return Next::Idle;
                    }
                }
            }
        }

        if self.queue.exit_requested.load(Ordering::Acquire) {
            return match self.receiver.try_recv() {
                Ok(buffer) => Next::Buffer(buffer),
                Err(_) => Next::Exit,
            };
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(buffer) => Next::Buffer(buffer),
            Err(RecvTimeoutError::Timeout) => Next::Idle,
            Err(RecvTimeoutError::Disconnected) => Next::Exit,
        }
    }
}
