//! Client-side command recording.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use strand_core::ResourceArena;
use strand_protocol::{Command, CommandEncoder, RawHandle, MAX_DESCRIPTOR_SETS};
use tracing::{error, trace};

use crate::queue::{CommandBuffer, CommandBufferQueue};

/// State bound on the execution side, mirrored so draws can stamp the
/// resources they use implicitly. Everything bound holds an arena link until
/// it is unbound, replaced or its render pass ends.
#[derive(Default)]
struct BoundMirror {
    sets: [Option<RawHandle>; MAX_DESCRIPTOR_SETS],
    program: Option<RawHandle>,
    target: Option<RawHandle>,
}

impl BoundMirror {
    fn handles(&self) -> Vec<RawHandle> {
        self.sets
            .iter()
            .flatten()
            .chain(self.program.iter())
            .chain(self.target.iter())
            .copied()
            .collect()
    }
}

/// Moves `slot` to `next`, holding the new resource before letting go of
/// the old one.
fn rebind(arena: &ResourceArena, slot: &mut Option<RawHandle>, next: Option<RawHandle>, seq: u64) {
    if *slot == next {
        return;
    }
    if let Some(handle) = next {
        arena.hold_bound(handle);
    }
    if let Some(previous) = std::mem::replace(slot, next) {
        arena.drop_bound(previous, seq);
    }
}

/// Records commands into the current buffer and hands finished buffers to
/// the execution thread. Client thread only.
pub struct CommandStream {
    arena: Arc<ResourceArena>,
    queue: Arc<CommandBufferQueue>,
    capacity: usize,
    seq: u64,
    commands: Vec<Command>,
    bound: BoundMirror,
    scratch: Vec<RawHandle>,
}

impl CommandStream {
    pub fn new(arena: Arc<ResourceArena>, queue: Arc<CommandBufferQueue>, capacity: usize) -> Self {
        Self {
            arena,
            queue,
            capacity,
            seq: 1,
            commands: Vec::new(),
            bound: BoundMirror::default(),
            scratch: Vec::new(),
        }
    }

    /// Sequence number of the buffer being recorded.
    pub fn current_seq(&self) -> u64 {
        self.seq
    }

    /// Sequence number of the last buffer handed to the execution thread,
    /// 0 if none was.
    pub fn last_flushed(&self) -> u64 {
        self.seq - 1
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Submits the current buffer. An empty buffer is not submitted.
    /// Returns the sequence number to wait on for everything recorded so far.
    pub fn flush(&mut self) -> u64 {
        if self.commands.is_empty() {
            return self.last_flushed();
        }
        let seq = self.seq;
        let commands = std::mem::take(&mut self.commands);
        trace!("flushing command buffer {} ({} commands)", seq, commands.len());
        self.queue.submit(CommandBuffer { seq, commands });
        self.seq += 1;
        seq
    }

    /// Stamps handles and maintains the links and bound state a command implies.
    fn track(&mut self, command: &Command) {
        let seq = self.seq;
        self.scratch.clear();
        let scratch = &mut self.scratch;
        command.visit_handles(&mut |raw| scratch.push(raw));
        if !self.scratch.is_empty() {
            self.arena.touch(&self.scratch, seq);
        }

        match command {
            Command::UpdateDescriptorSetBuffer {
                set, slot, buffer, ..
            } => self.arena.occupy(set.raw(), *slot, buffer.raw(), seq),
            Command::UpdateDescriptorSetTexture {
                set, slot, texture, ..
            } => self.arena.occupy(set.raw(), *slot, texture.raw(), seq),
            Command::BindDescriptorSet { index, set, .. } => {
                let slot = &mut self.bound.sets[*index as usize];
                rebind(&self.arena, slot, Some(set.raw()), seq);
            }
            Command::UnbindDescriptorSet { index } => {
                rebind(&self.arena, &mut self.bound.sets[*index as usize], None, seq);
            }
            Command::BindPipeline { state } => {
                let program = Some(state.program.raw());
                rebind(&self.arena, &mut self.bound.program, program, seq);
            }
            Command::BeginRenderPass { target, .. } => {
                rebind(&self.arena, &mut self.bound.target, Some(target.raw()), seq);
            }
            Command::EndRenderPass {} => {
                rebind(&self.arena, &mut self.bound.target, None, seq);
                rebind(&self.arena, &mut self.bound.program, None, seq);
            }
            Command::Draw { .. } | Command::DispatchCompute { .. } => {
                let implicit = self.bound.handles();
                if !implicit.is_empty() {
                    self.arena.touch_bound(&implicit, seq);
                }
            }
            _ => {}
        }
    }
}

impl CommandEncoder for CommandStream {
    fn encode(&mut self, command: Command) {
        if self.commands.len() >= self.capacity {
            error!(
                "command buffer {} overflowed its capacity of {} commands at {}",
                self.seq,
                self.capacity,
                command.op().name()
            );
            panic!(
                "command buffer overflow: more than {} commands recorded without a flush",
                self.capacity
            );
        }
        if let Command::BindDescriptorSet { index, .. } | Command::UnbindDescriptorSet { index } =
            &command
        {
            assert!(
                (*index as usize) < MAX_DESCRIPTOR_SETS,
                "descriptor set index {} exceeds the maximum of {}",
                index,
                MAX_DESCRIPTOR_SETS - 1
            );
        }
        self.track(&command);
        self.commands.push(command);
    }

    fn await_reply<T>(&mut self, reply: Receiver<T>) -> T {
        self.flush();
        match reply.recv() {
            Ok(value) => value,
            Err(_) => {
                error!("execution thread terminated before replying");
                panic!("execution thread terminated");
            }
        }
    }
}
