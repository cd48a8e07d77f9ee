//! The execution thread: the only thread that touches native GPU objects.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use strand_core::{ResourceArena, StrandConfig, Timeline};
use strand_protocol::{Capabilities, Dispatcher, OpKind};
use tracing::{error, info, trace};

use crate::backend::Backend;
use crate::driver::CoreDriver;
use crate::error::{BackendError, DriverError};
use crate::queue::{CommandBuffer, CommandBufferReceiver, Next};

/// How long the thread sleeps on an empty queue with nothing in flight.
const IDLE_WAIT: Duration = Duration::from_millis(20);

pub const THREAD_NAME: &str = "strand-exec";

/// Wakes every waiter if the execution thread dies, so `flush_and_wait`
/// reports an error instead of blocking forever.
struct PanicGuard {
    timeline: Arc<Timeline>,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("execution thread panicked");
            self.timeline.mark_device_lost();
        }
    }
}

/// Starts the execution thread. The backend is constructed on that thread
/// by `factory`; start-up failures are returned here.
pub fn spawn<B, F>(
    factory: F,
    arena: Arc<ResourceArena>,
    timeline: Arc<Timeline>,
    receiver: CommandBufferReceiver,
    config: &StrandConfig,
) -> Result<(JoinHandle<()>, Capabilities), DriverError>
where
    B: Backend,
    F: FnOnce() -> Result<B, BackendError> + Send + 'static,
{
    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    let policy = config.policy.clone();
    let set_cache_capacity = config.bindings.set_cache_capacity;
    let poll_interval = Duration::from_micros(config.engine.retire_poll_interval_us.max(1));

    let handle = thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            let _guard = PanicGuard {
                timeline: timeline.clone(),
            };
            let backend = match factory() {
                Ok(backend) => backend,
                Err(e) => {
                    error!("backend failed to start: {}", e);
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let mut driver = CoreDriver::new(backend, arena, timeline, policy, set_cache_capacity);
            let _ = ready_tx.send(Ok(driver.capabilities().clone()));
            run(&mut driver, &receiver, poll_interval);
        })?;

    match ready_rx.recv() {
        Ok(Ok(capabilities)) => Ok((handle, capabilities)),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(DriverError::Startup(e))
        }
        Err(_) => {
            let _ = handle.join();
            Err(DriverError::ExecutionThreadGone)
        }
    }
}

fn run<B: Backend>(driver: &mut CoreDriver<B>, receiver: &CommandBufferReceiver, poll: Duration) {
    info!("execution thread started");
    let dispatcher = Dispatcher::<CoreDriver<B>>::new();
    loop {
        let timeout = if driver.has_work_in_flight() { poll } else { IDLE_WAIT };
        match receiver.next(timeout) {
            Next::Buffer(buffer) => {
                execute(&dispatcher, driver, buffer);
                driver.retire();
            }
            Next::Idle => driver.retire(),
            Next::Exit => break,
        }
    }
    driver.shutdown();
    info!("execution thread stopped");
}

/// Runs one command buffer in order. Once the device is lost only
/// synchronous queries still execute, so their callers are answered.
pub fn execute<B: Backend>(
    dispatcher: &Dispatcher<CoreDriver<B>>,
    driver: &mut CoreDriver<B>,
    buffer: CommandBuffer,
) {
    let CommandBuffer { seq, commands } = buffer;
    trace!("command buffer {}: {} commands", seq, commands.len());
    driver.begin_buffer(seq);
    for command in commands {
        if driver.is_device_lost() && command.op().kind() == OpKind::Async {
            continue;
        }
        dispatcher.dispatch(driver, command);
        driver.command_executed();
    }
    driver.end_buffer(seq);
}
