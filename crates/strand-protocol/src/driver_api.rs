//! The operation list shared by the recorder and every backend.
//!
//! `driver_api!` is invoked exactly once, below. From that single list it
//! generates the operation tags and their descriptors, the `Command` record,
//! the `DriverApi` trait backends implement, the per-driver `Dispatcher`
//! table, and the `CommandEncoder` stubs the client side records through.
//! Adding an operation means adding one line to the invocation.

use crossbeam_channel::{Receiver, Sender};

use crate::binding::SetLayoutDescriptor;
use crate::handle::*;
use crate::pixel::PixelBufferDescriptor;
use crate::references::References;
use crate::types::*;

/// Reply channel carried by synchronous commands.
pub type Reply<T> = Sender<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Queued; the client never observes a result.
    Async,
    /// The client blocks until the execution thread produced the result.
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDescriptor {
    pub op: Op,
    pub name: &'static str,
    pub kind: OpKind,
    pub arity: usize,
}

#[cold]
#[inline(never)]
fn mismatched(expected: Op, found: Op) -> ! {
    tracing::error!(
        expected = expected.name(),
        found = found.name(),
        "dispatch routine received the wrong command"
    );
    panic!(
        "corrupt command stream: routine for `{}` received `{}`",
        expected.name(),
        found.name()
    );
}

macro_rules! driver_api_unit {
    ($_t:tt) => {
        ()
    };
}

macro_rules! driver_api {
    (
        async {
            $(
                $(#[$adoc:meta])*
                $avariant:ident => fn $aname:ident($($aarg:ident: $aty:ty),* $(,)?);
            )*
        }
        sync {
            $(
                $(#[$sdoc:meta])*
                $svariant:ident => fn $sname:ident($($sarg:ident: $sty:ty),* $(,)?) -> $sret:ty;
            )*
        }
    ) => {
        /// Operation tag. The discriminant indexes [`OPERATIONS`] and every dispatch table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Op {
            $($avariant,)*
            $($svariant,)*
        }

        /// Every operation, in tag order.
        pub static OPERATIONS: &[OpDescriptor] = &[
            $(
                OpDescriptor {
                    op: Op::$avariant,
                    name: stringify!($aname),
                    kind: OpKind::Async,
                    arity: <[()]>::len(&[$(driver_api_unit!($aarg)),*]),
                },
            )*
            $(
                OpDescriptor {
                    op: Op::$svariant,
                    name: stringify!($sname),
                    kind: OpKind::Sync,
                    arity: <[()]>::len(&[$(driver_api_unit!($sarg)),*]),
                },
            )*
        ];

        impl Op {
            pub fn from_raw(raw: u16) -> Option<Self> {
                OPERATIONS.get(raw as usize).map(|d| d.op)
            }

            pub fn descriptor(self) -> &'static OpDescriptor {
                &OPERATIONS[self as usize]
            }

            pub fn name(self) -> &'static str {
                self.descriptor().name
            }

            pub fn kind(self) -> OpKind {
                self.descriptor().kind
            }
        }

        /// One recorded operation with its owned arguments.
        #[derive(Debug)]
        pub enum Command {
            $(
                $(#[$adoc])*
                $avariant { $($aarg: $aty),* },
            )*
            $(
                $(#[$sdoc])*
                $svariant { $($sarg: $sty,)* reply: Reply<$sret> },
            )*
        }

        impl Command {
            pub fn op(&self) -> Op {
                match self {
                    $(Self::$avariant { .. } => Op::$avariant,)*
                    $(Self::$svariant { .. } => Op::$svariant,)*
                }
            }

            /// Calls `visit` for every resource handle among the arguments.
            pub fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
                match self {
                    $(
                        Self::$avariant { $($aarg),* } => {
                            $(References::visit_handles($aarg, visit);)*
                        }
                    )*
                    $(
                        Self::$svariant { $($sarg,)* .. } => {
                            $(References::visit_handles($sarg, visit);)*
                        }
                    )*
                }
            }
        }

        /// Execution routines a concrete driver supplies, one per operation.
        pub trait DriverApi {
            $(
                $(#[$adoc])*
                fn $aname(&mut self, $($aarg: $aty),*);
            )*
            $(
                $(#[$sdoc])*
                fn $sname(&mut self, $($sarg: $sty),*) -> $sret;
            )*
        }

        /// Decodes a command and invokes the matching routine on a concrete driver.
        pub type Routine<D> = fn(&mut D, Command);

        /// Dispatch table for one driver type, built once and indexed by tag.
        pub struct Dispatcher<D: DriverApi> {
            table: Vec<Routine<D>>,
        }

        impl<D: DriverApi> Dispatcher<D> {
            pub fn new() -> Self {
                let table: Vec<Routine<D>> = vec![
                    $(Self::$aname as Routine<D>,)*
                    $(Self::$sname as Routine<D>,)*
                ];
                debug_assert_eq!(table.len(), OPERATIONS.len());
                Self { table }
            }

            pub fn len(&self) -> usize {
                self.table.len()
            }

            pub fn is_empty(&self) -> bool {
                self.table.is_empty()
            }

            /// Looks up the routine for a raw tag. An unknown tag means the stream
            /// is corrupt, and skipping it would desynchronize everything after it.
            pub fn routine(&self, tag: u16) -> Routine<D> {
                match self.table.get(tag as usize) {
                    Some(routine) => *routine,
                    None => {
                        tracing::error!(tag, "unknown operation tag");
                        panic!("corrupt command stream: unknown operation tag {}", tag);
                    }
                }
            }

            pub fn dispatch(&self, driver: &mut D, command: Command) {
                let tag = command.op() as u16;
                (self.routine(tag))(driver, command);
            }

            $(
                fn $aname(driver: &mut D, command: Command) {
                    match command {
                        Command::$avariant { $($aarg),* } => driver.$aname($($aarg),*),
                        other => mismatched(Op::$avariant, other.op()),
                    }
                }
            )*

            $(
                fn $sname(driver: &mut D, command: Command) {
                    match command {
                        Command::$svariant { $($sarg,)* reply } => {
                            let value = driver.$sname($($sarg),*);
                            // The caller is parked on the other end; a closed
                            // channel only happens while it is unwinding.
                            let _ = reply.send(value);
                        }
                        other => mismatched(Op::$svariant, other.op()),
                    }
                }
            )*
        }

        impl<D: DriverApi> Default for Dispatcher<D> {
            fn default() -> Self {
                Self::new()
            }
        }

        /// Client-side encode stubs. Implementors provide `encode` (append to the
        /// current buffer) and `await_reply` (flush and block for a sync result).
        pub trait CommandEncoder {
            fn encode(&mut self, command: Command);

            fn await_reply<T>(&mut self, reply: Receiver<T>) -> T;

            $(
                $(#[$adoc])*
                fn $aname(&mut self, $($aarg: $aty),*) {
                    self.encode(Command::$avariant { $($aarg),* });
                }
            )*

            $(
                $(#[$sdoc])*
                fn $sname(&mut self, $($sarg: $sty),*) -> $sret {
                    let (reply, receiver) = crossbeam_channel::bounded(1);
                    self.encode(Command::$svariant { $($sarg,)* reply });
                    self.await_reply(receiver)
                }
            )*
        }
    };
}

driver_api! {
    async {
        /// Creates the native texture backing `handle`.
        CreateTexture => fn create_texture(handle: TextureHandle, descriptor: TextureDescriptor);
        /// Uploads pixels into one mip level.
        UpdateTexture => fn update_texture(texture: TextureHandle, level: u8, pixels: PixelBufferDescriptor);
        CreateBuffer => fn create_buffer(handle: BufferHandle, descriptor: BufferDescriptor);
        UpdateBuffer => fn update_buffer(buffer: BufferHandle, offset: u64, data: Vec<u8>);
        CreateSetLayout => fn create_set_layout(handle: SetLayoutHandle, descriptor: SetLayoutDescriptor);
        CreateDescriptorSet => fn create_descriptor_set(handle: DescriptorSetHandle, layout: SetLayoutHandle);
        /// Writes a buffer range into a slot of a logical descriptor set.
        UpdateDescriptorSetBuffer => fn update_descriptor_set_buffer(
            set: DescriptorSetHandle,
            slot: u8,
            buffer: BufferHandle,
            offset: u64,
            size: u64,
        );
        /// Writes a texture and its sampler parameters into a slot.
        UpdateDescriptorSetTexture => fn update_descriptor_set_texture(
            set: DescriptorSetHandle,
            slot: u8,
            texture: TextureHandle,
            sampler: SamplerParams,
        );
        /// Marks a set as bound at `index` for the next commit.
        BindDescriptorSet => fn bind_descriptor_set(index: u8, set: DescriptorSetHandle, offsets: Vec<u32>);
        UnbindDescriptorSet => fn unbind_descriptor_set(index: u8);
        CreateProgram => fn create_program(handle: ProgramHandle, descriptor: ProgramDescriptor);
        CreateRenderTarget => fn create_render_target(handle: RenderTargetHandle, descriptor: RenderTargetDescriptor);
        CreateSwapChain => fn create_swap_chain(handle: SwapChainHandle, descriptor: SwapChainDescriptor);
        /// Render target whose single color attachment is the swap chain's current image.
        CreateSwapChainRenderTarget => fn create_swap_chain_render_target(
            handle: RenderTargetHandle,
            swap_chain: SwapChainHandle,
        );
        /// Acquires the next presentable image.
        BeginFrame => fn begin_frame(swap_chain: SwapChainHandle);
        /// Presents the image acquired by `begin_frame`.
        EndFrame => fn end_frame(swap_chain: SwapChainHandle);
        BeginRenderPass => fn begin_render_pass(target: RenderTargetHandle, params: RenderPassParams);
        EndRenderPass => fn end_render_pass();
        SetViewport => fn set_viewport(viewport: Rect2D);
        SetScissor => fn set_scissor(scissor: Rect2D);
        BindPipeline => fn bind_pipeline(state: PipelineState);
        Draw => fn draw(vertex_count: u32, instance_count: u32, first_vertex: u32);
        DispatchCompute => fn dispatch_compute(program: ProgramHandle, groups: [u32; 3]);
        /// Reclaims every pooled native set. Only valid once the device is idle.
        ClearBindingHistory => fn clear_binding_history();
        /// Drops cached render passes and framebuffers once they retire.
        ClearAttachmentCache => fn clear_attachment_cache();
        InsertEventMarker => fn insert_event_marker(label: String);
    }
    sync {
        GetCapabilities => fn get_capabilities() -> Capabilities;
        IsTextureFormatSupported => fn is_texture_format_supported(
            format: TextureFormat,
            usage: TextureUsage,
        ) -> bool;
        GetStats => fn get_stats() -> DriverStats;
    }
}
