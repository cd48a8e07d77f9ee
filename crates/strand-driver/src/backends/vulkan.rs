//! Vulkan backend over `ash`.
//!
//! Runs without a surface: the swap chain is a ring of offscreen images and
//! "present" leaves the image in a transfer-source layout for readback. Each
//! submitted command buffer carries its own fence; retirement is polled.

use std::collections::{HashMap, VecDeque};
use std::ffi::{c_void, CStr};

use ash::vk;
use strand_core::config::BackendConfig;
use strand_core::ImageLayout;
use strand_protocol::{
    compute_pixel_size, BindingKind, BufferDescriptor, BufferUsage, Capabilities, CullingMode,
    DescriptorCounts, Filter, LayoutMask, PixelBufferDescriptor, PixelLayout, ProgramDescriptor,
    RasterState, Rect2D, RenderPassParams, SampleCounts, SamplerParams, SamplerTarget,
    ShaderSource, ShaderStages, SwapChainDescriptor, TargetBufferFlags, TextureDescriptor,
    TextureFormat, TextureUsage, WrapMode, MAX_COLOR_ATTACHMENTS,
};
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, FramebufferAttachment, RenderPassKey, SetWrite, WriteResource};
use crate::error::{AcquireError, BackendError};

const APP_NAME: &CStr = c"strand";
const ENTRY_POINT: &CStr = c"main";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

// ── Native objects ──────────────────────────────────────────

pub struct VulkanTexture {
    image: vk::Image,
    memory: vk::DeviceMemory,
    /// View over every level and layer, used for sampling.
    view: vk::ImageView,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
}

pub struct VulkanBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut c_void,
    size: u64,
}

pub struct VulkanSetLayout {
    layout: vk::DescriptorSetLayout,
    counts: DescriptorCounts,
    pools: Vec<vk::DescriptorPool>,
    /// Sets left in the newest pool.
    remaining: u32,
}

pub struct VulkanProgram {
    layout: vk::PipelineLayout,
    modules: Vec<vk::ShaderModule>,
    compute: Option<vk::Pipeline>,
}

pub struct VulkanFramebuffer {
    framebuffer: vk::Framebuffer,
    views: Vec<vk::ImageView>,
}

pub struct VulkanSwapChain {
    images: Vec<VulkanTexture>,
    next: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    layout: vk::PipelineLayout,
    pass: vk::RenderPass,
    raster: RasterState,
    samples: u8,
    colors: u8,
}

struct InFlight {
    seq: u64,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    staging: Vec<VulkanBuffer>,
}

// ── Conversions ─────────────────────────────────────────────

fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8 => vk::Format::R8_UNORM,
        TextureFormat::Rg8 => vk::Format::R8G8_UNORM,
        TextureFormat::Rgba8 => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Srgb8A8 => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8 => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::R32F => vk::Format::R32_SFLOAT,
        TextureFormat::Rgba16F => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32F => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Depth16 => vk::Format::D16_UNORM,
        TextureFormat::Depth24 => vk::Format::X8_D24_UNORM_PACK32,
        TextureFormat::Depth32F => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

fn aspect_of(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn vk_samples(samples: u8) -> vk::SampleCountFlags {
    vk::SampleCountFlags::from_raw(u32::from(samples.max(1)))
}

fn vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::DepthRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        // No surface to present to; presented images are read back.
        ImageLayout::Present => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    }
}

/// Access mask and pipeline stage an image in `layout` is used with.
fn access_of(layout: ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        ImageLayout::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        ImageLayout::TransferDst => (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
        ImageLayout::ColorAttachment => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::DepthAttachment => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        ImageLayout::ShaderRead | ImageLayout::DepthRead => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        ImageLayout::Present => (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER),
    }
}

fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::DynamicUniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        BindingKind::Sampler | BindingKind::ExternalSampler => {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        }
        BindingKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
    }
}

fn stage_flags(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    if flags.is_empty() {
        vk::ShaderStageFlags::ALL
    } else {
        flags
    }
}

fn vk_filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

fn vk_wrap(wrap: WrapMode) -> vk::SamplerAddressMode {
    match wrap {
        WrapMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
        WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

fn sample_counts(flags: vk::SampleCountFlags) -> SampleCounts {
    SampleCounts::from_bits_truncate(flags.as_raw() as u8)
}

fn load_op(clear: bool, discard: bool) -> vk::AttachmentLoadOp {
    if clear {
        vk::AttachmentLoadOp::CLEAR
    } else if discard {
        vk::AttachmentLoadOp::DONT_CARE
    } else {
        vk::AttachmentLoadOp::LOAD
    }
}

fn store_op(discard: bool) -> vk::AttachmentStoreOp {
    if discard {
        vk::AttachmentStoreOp::DONT_CARE
    } else {
        vk::AttachmentStoreOp::STORE
    }
}

fn color_flag(index: usize) -> TargetBufferFlags {
    TargetBufferFlags::from_bits_truncate(1 << index)
}

fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..properties.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && properties.memory_types[i as usize]
                .property_flags
                .contains(flags)
    })
}

fn begin_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer, vk::Result> {
    let info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffers = unsafe { device.allocate_command_buffers(&info) }?;
    let Some(&command_buffer) = buffers.first() else {
        return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    };
    let begin =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.begin_command_buffer(command_buffer, &begin) }?;
    Ok(command_buffer)
}

// ── Backend ─────────────────────────────────────────────────

pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    capabilities: Capabilities,
    command_pool: vk::CommandPool,
    /// Command buffer being recorded. Always in the recording state.
    recording: vk::CommandBuffer,
    staging: Vec<VulkanBuffer>,
    in_flight: VecDeque<InFlight>,
    submitted: u64,
    sets_per_pool: u32,
    /// Fills unused set indices of pipeline layouts.
    empty_set_layout: vk::DescriptorSetLayout,
    pipelines: HashMap<PipelineKey, vk::Pipeline>,
    bound_compute: Option<vk::PipelineLayout>,
}

impl VulkanBackend {
    pub fn new(config: &BackendConfig, sets_per_pool: u32) -> Result<Self, BackendError> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| BackendError::Unavailable(format!("Vulkan loader not found: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .engine_name(APP_NAME)
            .api_version(vk::make_api_version(0, 1, 1, 0));

        let mut layers = Vec::new();
        if config.validation {
            let available = unsafe { entry.enumerate_instance_layer_properties() }?;
            let present = available
                .iter()
                .any(|l| l.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
            if present {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
            }
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        match Self::with_instance(entry, instance, config, sets_per_pool) {
            Ok(backend) => Ok(backend),
            Err((instance, e)) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn with_instance(
        entry: ash::Entry,
        instance: ash::Instance,
        config: &BackendConfig,
        sets_per_pool: u32,
    ) -> Result<Self, (ash::Instance, BackendError)> {
        let devices = match unsafe { instance.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(e) => return Err((instance, e.into())),
        };
        let Some(&physical_device) = devices.get(config.device_index as usize) else {
            let message = format!(
                "no Vulkan device at index {} ({} available)",
                config.device_index,
                devices.len()
            );
            return Err((instance, BackendError::Unavailable(message)));
        };

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let Some(queue_family) = families
            .iter()
            .position(|f| f.queue_flags.contains(wanted))
            .map(|i| i as u32)
        else {
            let message = "no queue family with graphics and compute".to_string();
            return Err((instance, BackendError::Unavailable(message)));
        };

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities);
        let device_info =
            vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));
        let device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
            Ok(device) => device,
            Err(e) => return Err((instance, e.into())),
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let limits = properties.limits;
        let capabilities = Capabilities {
            backend: "vulkan".to_string(),
            device_name,
            color_sample_counts: sample_counts(limits.framebuffer_color_sample_counts),
            depth_sample_counts: sample_counts(limits.framebuffer_depth_sample_counts),
            storage_buffers: true,
            max_color_attachments: limits.max_color_attachments.min(MAX_COLOR_ATTACHMENTS as u32)
                as u8,
            uniform_offset_alignment: limits.min_uniform_buffer_offset_alignment as u32,
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let setup = || -> Result<(vk::CommandPool, vk::DescriptorSetLayout, vk::CommandBuffer), vk::Result> {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(queue_family);
            let pool = unsafe { device.create_command_pool(&pool_info, None) }?;
            let empty = unsafe {
                device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default(), None)
            }?;
            let recording = begin_command_buffer(&device, pool)?;
            Ok((pool, empty, recording))
        };
        // Destroying the device releases whatever the setup managed to create.
        let (command_pool, empty_set_layout, recording) = match setup() {
            Ok(objects) => objects,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err((instance, e.into()));
            }
        };

        info!(
            "Vulkan device {} ({}) ready, queue family {}",
            config.device_index, capabilities.device_name, queue_family
        );
        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            memory_properties,
            capabilities,
            command_pool,
            recording,
            staging: Vec::new(),
            in_flight: VecDeque::new(),
            submitted: 0,
            sets_per_pool: sets_per_pool.max(1),
            empty_set_layout,
            pipelines: HashMap::new(),
            bound_compute: None,
        })
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory, BackendError> {
        let Some(type_index) =
            find_memory_type(&self.memory_properties, requirements.memory_type_bits, flags)
        else {
            return Err(BackendError::Unsupported(format!("no memory type with {flags:?}")));
        };
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        Ok(unsafe { self.device.allocate_memory(&info, None) }?)
    }

    fn host_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<VulkanBuffer, BackendError> {
        let info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory = match self.allocate_memory(
            requirements,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        let mapped = unsafe {
            self.device.bind_buffer_memory(buffer, memory, 0).and_then(|()| {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            })
        };
        match mapped {
            Ok(mapped) => Ok(VulkanBuffer {
                buffer,
                memory,
                mapped,
                size,
            }),
            Err(e) => {
                unsafe {
                    self.device.destroy_buffer(buffer, None);
                    self.device.free_memory(memory, None);
                }
                Err(e.into())
            }
        }
    }

    fn free_buffer(&self, buffer: VulkanBuffer) {
        unsafe {
            self.device.unmap_memory(buffer.memory);
            self.device.destroy_buffer(buffer.buffer, None);
            self.device.free_memory(buffer.memory, None);
        }
    }

    fn image(
        &self,
        descriptor: &TextureDescriptor,
        usage: vk::ImageUsageFlags,
    ) -> Result<VulkanTexture, BackendError> {
        let format = vk_format(descriptor.format);
        let aspect = aspect_of(descriptor.format);
        let (image_type, view_type, layers, flags) = match descriptor.target {
            SamplerTarget::Texture2d | SamplerTarget::External => (
                vk::ImageType::TYPE_2D,
                vk::ImageViewType::TYPE_2D,
                1,
                vk::ImageCreateFlags::empty(),
            ),
            SamplerTarget::Texture2dArray => (
                vk::ImageType::TYPE_2D,
                vk::ImageViewType::TYPE_2D_ARRAY,
                descriptor.depth.max(1),
                vk::ImageCreateFlags::empty(),
            ),
            SamplerTarget::Cubemap => (
                vk::ImageType::TYPE_2D,
                vk::ImageViewType::CUBE,
                6,
                vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ),
            SamplerTarget::Texture3d => (
                vk::ImageType::TYPE_3D,
                vk::ImageViewType::TYPE_3D,
                1,
                vk::ImageCreateFlags::empty(),
            ),
        };
        let depth = if descriptor.target == SamplerTarget::Texture3d {
            descriptor.depth.max(1)
        } else {
            1
        };

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(format)
            .extent(vk::Extent3D {
                width: descriptor.width.max(1),
                height: descriptor.height.max(1),
                depth,
            })
            .mip_levels(u32::from(descriptor.levels.max(1)))
            .array_layers(layers)
            .samples(vk_samples(descriptor.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = match self.allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            );
        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    self.device.destroy_image(image, None);
                    self.device.free_memory(memory, None);
                }
                return Err(e.into());
            }
        };
        Ok(VulkanTexture {
            image,
            memory,
            view,
            format,
            aspect,
        })
    }

    fn free_image(&self, texture: VulkanTexture) {
        unsafe {
            self.device.destroy_image_view(texture.view, None);
            self.device.destroy_image(texture.image, None);
            self.device.free_memory(texture.memory, None);
        }
    }

    fn create_pool(&self, counts: &DescriptorCounts) -> Result<vk::DescriptorPool, BackendError> {
        let scaled = counts.scaled(self.sets_per_pool);
        let mut sizes: Vec<vk::DescriptorPoolSize> = [
            (vk::DescriptorType::UNIFORM_BUFFER, scaled.uniform),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, scaled.dynamic_uniform),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, scaled.sampler),
            (vk::DescriptorType::INPUT_ATTACHMENT, scaled.input_attachment),
            (vk::DescriptorType::STORAGE_BUFFER, scaled.storage),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
        .collect();
        if sizes.is_empty() {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            });
        }
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(self.sets_per_pool)
            .pool_sizes(&sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None) }?)
    }

    fn shader_module(&self, words: &[u32]) -> Result<vk::ShaderModule, BackendError> {
        let info = vk::ShaderModuleCreateInfo::default().code(words);
        Ok(unsafe { self.device.create_shader_module(&info, None) }?)
    }

    fn graphics_pipeline(
        &mut self,
        program: &VulkanProgram,
        raster: &RasterState,
        pass: vk::RenderPass,
        key: &RenderPassKey,
    ) -> Result<vk::Pipeline, BackendError> {
        let pipeline_key = PipelineKey {
            layout: program.layout,
            pass,
            raster: *raster,
            samples: key.samples,
            colors: key.colors.len() as u8,
        };
        if let Some(pipeline) = self.pipelines.get(&pipeline_key) {
            return Ok(*pipeline);
        }

        let [vertex, fragment] = program.modules[..] else {
            return Err(BackendError::Unsupported(
                "graphics pipeline from a program without vertex and fragment stages".to_string(),
            ));
        };
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(ENTRY_POINT),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let cull_mode = match raster.culling {
            CullingMode::None => vk::CullModeFlags::NONE,
            CullingMode::Front => vk::CullModeFlags::FRONT,
            CullingMode::Back => vk::CullModeFlags::BACK,
        };
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk_samples(key.samples));
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(raster.depth_test)
            .depth_write_enable(raster.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let write_mask = if raster.color_write {
            vk::ColorComponentFlags::RGBA
        } else {
            vk::ColorComponentFlags::empty()
        };
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = key
            .colors
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(raster.blend)
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .alpha_blend_op(vk::BlendOp::ADD)
                    .color_write_mask(write_mask)
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(program.layout)
            .render_pass(pass)
            .subpass(0);
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| BackendError::from(e))?;
        let Some(&pipeline) = pipelines.first() else {
            return Err(BackendError::OutOfHostMemory);
        };
        debug!("graphics pipeline created ({} samples, {} colors)", key.samples, key.colors.len());
        self.pipelines.insert(pipeline_key, pipeline);
        Ok(pipeline)
    }

    fn destroy_pipelines(&mut self, matches: impl Fn(&PipelineKey) -> bool) {
        let doomed: Vec<PipelineKey> = self.pipelines.keys().filter(|k| matches(k)).copied().collect();
        for key in doomed {
            if let Some(pipeline) = self.pipelines.remove(&key) {
                unsafe { self.device.destroy_pipeline(pipeline, None) };
            }
        }
    }

    fn finish(&mut self, flight: InFlight) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[flight.command_buffer]);
            self.device.destroy_fence(flight.fence, None);
        }
        for buffer in flight.staging {
            self.free_buffer(buffer);
        }
    }
}

impl Backend for VulkanBackend {
    type Texture = VulkanTexture;
    type Buffer = VulkanBuffer;
    type Sampler = vk::Sampler;
    type SetLayout = VulkanSetLayout;
    type DescriptorSet = vk::DescriptorSet;
    type Program = VulkanProgram;
    type RenderPass = vk::RenderPass;
    type Framebuffer = VulkanFramebuffer;
    type SwapChain = VulkanSwapChain;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn is_format_supported(&self, format: TextureFormat, usage: TextureUsage) -> bool {
        let properties = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, vk_format(format))
        };
        let features = properties.optimal_tiling_features;
        let mut required = vk::FormatFeatureFlags::empty();
        if usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            required |= vk::FormatFeatureFlags::COLOR_ATTACHMENT;
        }
        if usage.intersects(TextureUsage::DEPTH_ATTACHMENT | TextureUsage::STENCIL_ATTACHMENT) {
            required |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if usage.contains(TextureUsage::SAMPLEABLE) {
            required |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
        }
        if usage.intersects(TextureUsage::UPLOADABLE | TextureUsage::BLIT_DST) {
            required |= vk::FormatFeatureFlags::TRANSFER_DST;
        }
        if usage.contains(TextureUsage::BLIT_SRC) {
            required |= vk::FormatFeatureFlags::TRANSFER_SRC;
        }
        !features.is_empty() && features.contains(required)
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<VulkanTexture, BackendError> {
        let mut usage = vk::ImageUsageFlags::empty();
        if descriptor.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if descriptor
            .usage
            .intersects(TextureUsage::DEPTH_ATTACHMENT | TextureUsage::STENCIL_ATTACHMENT)
        {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if descriptor.usage.contains(TextureUsage::SAMPLEABLE) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if descriptor.usage.contains(TextureUsage::SUBPASS_INPUT) {
            usage |= vk::ImageUsageFlags::INPUT_ATTACHMENT;
        }
        if descriptor
            .usage
            .intersects(TextureUsage::UPLOADABLE | TextureUsage::BLIT_DST)
        {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if descriptor.usage.contains(TextureUsage::BLIT_SRC) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if usage.is_empty() {
            usage = vk::ImageUsageFlags::SAMPLED;
        }
        self.image(descriptor, usage)
    }

    fn destroy_texture(&mut self, texture: VulkanTexture) {
        self.free_image(texture);
    }

    fn upload_texture(
        &mut self,
        texture: &VulkanTexture,
        descriptor: &TextureDescriptor,
        level: u8,
        pixels: &PixelBufferDescriptor,
    ) -> Result<(), BackendError> {
        let staging = self.host_buffer(pixels.data.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                pixels.data.as_ptr(),
                staging.mapped.cast::<u8>(),
                pixels.data.len(),
            );
        }

        let (row_length, offset) = match pixels.layout {
            PixelLayout::Uncompressed {
                format,
                ty,
                stride,
                alignment,
                left,
                top,
            } => {
                let pixel = compute_pixel_size(format, ty).map_err(|e| {
                    BackendError::Unsupported(format!("pixel layout: {e}"))
                })? as u64;
                let width = if stride == 0 {
                    (descriptor.width >> level).max(1)
                } else {
                    stride
                };
                let align = u64::from(alignment.max(1));
                let row_bytes = (u64::from(width) * pixel).div_ceil(align) * align;
                let row_length = if pixel > 0 && row_bytes % pixel == 0 {
                    (row_bytes / pixel) as u32
                } else {
                    width
                };
                (row_length, u64::from(top) * row_bytes + u64::from(left) * pixel)
            }
            PixelLayout::Compressed { .. } => (0, 0),
        };

        let region = vk::BufferImageCopy::default()
            .buffer_offset(offset)
            .buffer_row_length(row_length)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(texture.aspect)
                    .mip_level(u32::from(level))
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: (descriptor.width >> level).max(1),
                height: (descriptor.height >> level).max(1),
                depth: 1,
            });
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.recording,
                staging.buffer,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        self.staging.push(staging);
        Ok(())
    }

    fn create_buffer(&mut self, descriptor: &BufferDescriptor) -> Result<VulkanBuffer, BackendError> {
        let mut usage = vk::BufferUsageFlags::TRANSFER_DST;
        if descriptor.usage.contains(BufferUsage::UNIFORM) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if descriptor.usage.contains(BufferUsage::STORAGE) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if descriptor.usage.contains(BufferUsage::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if descriptor.usage.contains(BufferUsage::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        self.host_buffer(descriptor.size, usage)
    }

    fn destroy_buffer(&mut self, buffer: VulkanBuffer) {
        self.free_buffer(buffer);
    }

    fn upload_buffer(&mut self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        if offset + data.len() as u64 > buffer.size {
            return Err(BackendError::Unsupported("buffer upload out of range".to_string()));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                buffer.mapped.cast::<u8>().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn create_sampler(&mut self, params: &SamplerParams) -> Result<vk::Sampler, BackendError> {
        let mipmap_mode = match params.mip {
            Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
            Filter::Linear => vk::SamplerMipmapMode::LINEAR,
        };
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk_filter(params.mag))
            .min_filter(vk_filter(params.min))
            .mipmap_mode(mipmap_mode)
            .address_mode_u(vk_wrap(params.wrap_s))
            .address_mode_v(vk_wrap(params.wrap_t))
            .address_mode_w(vk_wrap(params.wrap_r))
            .compare_enable(params.compare)
            .compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .max_lod(vk::LOD_CLAMP_NONE);
        Ok(unsafe { self.device.create_sampler(&info, None) }?)
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_program(
        &mut self,
        descriptor: &ProgramDescriptor,
        set_layouts: &[Option<&VulkanSetLayout>],
    ) -> Result<VulkanProgram, BackendError> {
        let layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|l| l.map_or(self.empty_set_layout, |l| l.layout))
            .collect();
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&layouts);
        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }?;

        let mut program = VulkanProgram {
            layout,
            modules: Vec::new(),
            compute: None,
        };
        let words: Vec<&[u32]> = match &descriptor.source {
            ShaderSource::Graphics { vertex, fragment } => vec![vertex.as_slice(), fragment.as_slice()],
            ShaderSource::Compute { compute } => vec![compute.as_slice()],
        };
        for code in words {
            match self.shader_module(code) {
                Ok(module) => program.modules.push(module),
                Err(e) => {
                    self.destroy_program(program);
                    return Err(e);
                }
            }
        }

        if descriptor.is_compute() {
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(program.modules[0])
                .name(ENTRY_POINT);
            let info = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(layout);
            let created = unsafe {
                self.device
                    .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
            };
            match created {
                Ok(pipelines) => program.compute = pipelines.first().copied(),
                Err((_, e)) => {
                    self.destroy_program(program);
                    return Err(e.into());
                }
            }
        }
        debug!("program {} created with {} set layouts", descriptor.name, layouts.len());
        Ok(program)
    }

    fn destroy_program(&mut self, program: VulkanProgram) {
        self.destroy_pipelines(|key| key.layout == program.layout);
        if self.bound_compute == Some(program.layout) {
            self.bound_compute = None;
        }
        unsafe {
            if let Some(pipeline) = program.compute {
                self.device.destroy_pipeline(pipeline, None);
            }
            for module in program.modules {
                self.device.destroy_shader_module(module, None);
            }
            self.device.destroy_pipeline_layout(program.layout, None);
        }
    }

    fn create_set_layout(&mut self, mask: &LayoutMask) -> Result<VulkanSetLayout, BackendError> {
        let slots = mask.slots();
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..32u8)
            .filter(|slot| slots & (1 << slot) != 0)
            .filter_map(|slot| {
                mask.kind_of(slot).map(|kind| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(u32::from(slot))
                        .descriptor_type(descriptor_type(kind))
                        .descriptor_count(1)
                        .stage_flags(stage_flags(mask.stages_of(slot)))
                })
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }?;
        Ok(VulkanSetLayout {
            layout,
            counts: mask.counts(),
            pools: Vec::new(),
            remaining: 0,
        })
    }

    fn destroy_set_layout(&mut self, layout: VulkanSetLayout) {
        unsafe {
            for pool in layout.pools {
                self.device.destroy_descriptor_pool(pool, None);
            }
            self.device.destroy_descriptor_set_layout(layout.layout, None);
        }
    }

    fn allocate_set(&mut self, layout: &mut VulkanSetLayout) -> Result<vk::DescriptorSet, BackendError> {
        if layout.remaining == 0 || layout.pools.is_empty() {
            let pool = self.create_pool(&layout.counts)?;
            layout.pools.push(pool);
            layout.remaining = self.sets_per_pool;
            debug!("descriptor pool {} created for a layout", layout.pools.len());
        }
        let Some(&pool) = layout.pools.last() else {
            return Err(BackendError::OutOfHostMemory);
        };
        let layouts = [layout.layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }?;
        layout.remaining -= 1;
        sets.first().copied().ok_or(BackendError::OutOfHostMemory)
    }

    fn write_set(&mut self, set: &vk::DescriptorSet, writes: &[SetWrite<'_, Self>]) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|w| match &w.resource {
                WriteResource::Buffer {
                    buffer,
                    offset,
                    size,
                } => vk::DescriptorBufferInfo::default()
                    .buffer(buffer.buffer)
                    .offset(*offset)
                    .range(if *size == 0 { vk::WHOLE_SIZE } else { *size }),
                WriteResource::Texture { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = writes
            .iter()
            .map(|w| match &w.resource {
                WriteResource::Texture {
                    texture,
                    sampler,
                    layout,
                } => {
                    let info = vk::DescriptorImageInfo::default()
                        .image_view(texture.view)
                        .image_layout(vk_layout(*layout));
                    if w.kind == BindingKind::InputAttachment {
                        info
                    } else {
                        info.sampler(**sampler)
                    }
                }
                WriteResource::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect();

        let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(u32::from(w.slot))
                    .descriptor_type(descriptor_type(w.kind));
                match w.resource {
                    WriteResource::Buffer { .. } => {
                        write.buffer_info(std::slice::from_ref(&buffer_infos[i]))
                    }
                    WriteResource::Texture { .. } => {
                        write.image_info(std::slice::from_ref(&image_infos[i]))
                    }
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&descriptor_writes, &[]) };
    }

    fn bind_set(
        &mut self,
        program: &VulkanProgram,
        index: u8,
        set: &vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        let bind_point = if program.compute.is_some() {
            vk::PipelineBindPoint::COMPUTE
        } else {
            vk::PipelineBindPoint::GRAPHICS
        };
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.recording,
                bind_point,
                program.layout,
                u32::from(index),
                &[*set],
                dynamic_offsets,
            );
        }
    }

    fn transition(
        &mut self,
        texture: &VulkanTexture,
        _descriptor: &TextureDescriptor,
        from: ImageLayout,
        to: ImageLayout,
    ) {
        let (src_access, src_stage) = access_of(from);
        let (dst_access, dst_stage) = access_of(to);
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(vk_layout(from))
            .new_layout(vk_layout(to))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(texture.image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(texture.aspect)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            );
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.recording,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn create_render_pass(&mut self, key: &RenderPassKey) -> Result<vk::RenderPass, BackendError> {
        let samples = vk_samples(key.samples);
        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();
        for (i, format) in key.colors.iter().enumerate() {
            let flag = color_flag(i);
            color_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(vk_format(*format))
                    .samples(samples)
                    .load_op(load_op(key.clear.contains(flag), key.discard_start.contains(flag)))
                    .store_op(store_op(
                        key.discard_end.contains(flag) || key.has_resolve(i),
                    ))
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            );
        }

        let mut resolve_refs = Vec::new();
        if key.resolve != 0 {
            for (i, format) in key.colors.iter().enumerate() {
                if !key.has_resolve(i) {
                    resolve_refs.push(vk::AttachmentReference {
                        attachment: vk::ATTACHMENT_UNUSED,
                        layout: vk::ImageLayout::UNDEFINED,
                    });
                    continue;
                }
                resolve_refs.push(vk::AttachmentReference {
                    attachment: attachments.len() as u32,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                });
                attachments.push(
                    vk::AttachmentDescription::default()
                        .format(vk_format(*format))
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .load_op(vk::AttachmentLoadOp::DONT_CARE)
                        .store_op(store_op(key.discard_end.contains(color_flag(i))))
                        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                        .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                );
            }
        }

        let depth_ref = key.depth.map(|format| {
            let reference = vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            };
            let depth = TargetBufferFlags::DEPTH;
            let stencil = TargetBufferFlags::STENCIL;
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(vk_format(format))
                    .samples(samples)
                    .load_op(load_op(key.clear.contains(depth), key.discard_start.contains(depth)))
                    .store_op(store_op(key.discard_end.contains(depth)))
                    .stencil_load_op(load_op(
                        key.clear.contains(stencil),
                        key.discard_start.contains(stencil) || !format.has_stencil(),
                    ))
                    .stencil_store_op(store_op(
                        key.discard_end.contains(stencil) || !format.has_stencil(),
                    ))
                    .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
            reference
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if !resolve_refs.is_empty() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        if let Some(depth_ref) = &depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass));
        Ok(unsafe { self.device.create_render_pass(&info, None) }?)
    }

    fn destroy_render_pass(&mut self, pass: vk::RenderPass) {
        self.destroy_pipelines(|key| key.pass == pass);
        unsafe { self.device.destroy_render_pass(pass, None) };
    }

    fn create_framebuffer(
        &mut self,
        pass: &vk::RenderPass,
        attachments: &[FramebufferAttachment<'_, Self>],
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<VulkanFramebuffer, BackendError> {
        let mut views = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let info = vk::ImageViewCreateInfo::default()
                .image(attachment.texture.image)
                .view_type(if layers > 1 {
                    vk::ImageViewType::TYPE_2D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_2D
                })
                .format(attachment.texture.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(attachment.texture.aspect)
                        .base_mip_level(u32::from(attachment.level))
                        .level_count(1)
                        .base_array_layer(u32::from(attachment.layer))
                        .layer_count(layers.max(1)),
                );
            match unsafe { self.device.create_image_view(&info, None) } {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        unsafe { self.device.destroy_image_view(view, None) };
                    }
                    return Err(e.into());
                }
            }
        }
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(*pass)
            .attachments(&views)
            .width(width)
            .height(height)
            .layers(layers.max(1));
        match unsafe { self.device.create_framebuffer(&info, None) } {
            Ok(framebuffer) => Ok(VulkanFramebuffer { framebuffer, views }),
            Err(e) => {
                for view in views {
                    unsafe { self.device.destroy_image_view(view, None) };
                }
                Err(e.into())
            }
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: VulkanFramebuffer) {
        unsafe {
            self.device.destroy_framebuffer(framebuffer.framebuffer, None);
            for view in framebuffer.views {
                self.device.destroy_image_view(view, None);
            }
        }
    }

    fn begin_render_pass(
        &mut self,
        pass: &vk::RenderPass,
        framebuffer: &VulkanFramebuffer,
        key: &RenderPassKey,
        params: &RenderPassParams,
        width: u32,
        height: u32,
    ) {
        let color = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: params.clear_color,
            },
        };
        let resolves = key.resolve.count_ones() as usize;
        let mut clears = vec![color; key.colors.len() + resolves];
        if key.depth.is_some() {
            clears.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: params.clear_depth,
                    stencil: params.clear_stencil,
                },
            });
        }
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(*pass)
            .framebuffer(framebuffer.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            })
            .clear_values(&clears);
        unsafe {
            self.device
                .cmd_begin_render_pass(self.recording, &info, vk::SubpassContents::INLINE);
        }
    }

    fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.recording) };
    }

    fn set_viewport(&mut self, viewport: Rect2D) {
        let viewport = vk::Viewport {
            x: viewport.x as f32,
            y: viewport.y as f32,
            width: viewport.width as f32,
            height: viewport.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe { self.device.cmd_set_viewport(self.recording, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, scissor: Rect2D) {
        let rect = vk::Rect2D {
            offset: vk::Offset2D {
                x: scissor.x,
                y: scissor.y,
            },
            extent: vk::Extent2D {
                width: scissor.width,
                height: scissor.height,
            },
        };
        unsafe { self.device.cmd_set_scissor(self.recording, 0, &[rect]) };
    }

    fn bind_pipeline(
        &mut self,
        program: &VulkanProgram,
        raster: &RasterState,
        pass: &vk::RenderPass,
        key: &RenderPassKey,
    ) -> Result<(), BackendError> {
        let pipeline = self.graphics_pipeline(program, raster, *pass, key)?;
        unsafe {
            self.device
                .cmd_bind_pipeline(self.recording, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        unsafe {
            self.device
                .cmd_draw(self.recording, vertex_count, instance_count, first_vertex, 0);
        }
    }

    fn dispatch(&mut self, program: &VulkanProgram, groups: [u32; 3]) -> Result<(), BackendError> {
        let Some(pipeline) = program.compute else {
            return Err(BackendError::Unsupported(
                "dispatch of a program without a compute stage".to_string(),
            ));
        };
        unsafe {
            if self.bound_compute != Some(program.layout) {
                self.device
                    .cmd_bind_pipeline(self.recording, vk::PipelineBindPoint::COMPUTE, pipeline);
                self.bound_compute = Some(program.layout);
            }
            self.device
                .cmd_dispatch(self.recording, groups[0], groups[1], groups[2]);
        }
        Ok(())
    }

    fn insert_marker(&mut self, label: &str) {
        trace!("marker: {}", label);
    }

    fn create_swap_chain(&mut self, descriptor: &SwapChainDescriptor) -> Result<VulkanSwapChain, BackendError> {
        let image = TextureDescriptor::new_2d(
            descriptor.format,
            descriptor.width,
            descriptor.height,
            TextureUsage::COLOR_ATTACHMENT | TextureUsage::BLIT_SRC,
        );
        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC;
        let mut images = Vec::new();
        for _ in 0..descriptor.image_count.max(1) {
            match self.image(&image, usage) {
                Ok(texture) => images.push(texture),
                Err(e) => {
                    for texture in images {
                        self.free_image(texture);
                    }
                    return Err(e);
                }
            }
        }
        Ok(VulkanSwapChain { images, next: 0 })
    }

    fn destroy_swap_chain(&mut self, swap_chain: VulkanSwapChain) {
        for texture in swap_chain.images {
            self.free_image(texture);
        }
    }

    fn acquire_image(&mut self, swap_chain: &mut VulkanSwapChain) -> Result<u32, AcquireError> {
        if swap_chain.images.is_empty() {
            return Err(AcquireError::SurfaceLost);
        }
        let index = swap_chain.next;
        swap_chain.next = (index + 1) % swap_chain.images.len() as u32;
        Ok(index)
    }

    fn swap_chain_image<'a>(&self, swap_chain: &'a VulkanSwapChain, index: u32) -> &'a VulkanTexture {
        &swap_chain.images[index as usize]
    }

    fn present(&mut self, _swap_chain: &mut VulkanSwapChain, index: u32) -> Result<(), BackendError> {
        trace!("image {} presented", index);
        Ok(())
    }

    fn submit(&mut self, seq: u64) -> Result<(), BackendError> {
        let command_buffer = self.recording;
        unsafe { self.device.end_command_buffer(command_buffer) }?;
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        if let Err(e) = unsafe { self.device.queue_submit(self.queue, &[submit], fence) } {
            unsafe { self.device.destroy_fence(fence, None) };
            return Err(e.into());
        }
        self.in_flight.push_back(InFlight {
            seq,
            command_buffer,
            fence,
            staging: std::mem::take(&mut self.staging),
        });
        self.submitted = seq;
        self.bound_compute = None;
        self.recording = begin_command_buffer(&self.device, self.command_pool)?;
        Ok(())
    }

    fn retired(&mut self) -> Result<u64, BackendError> {
        while let Some(front) = self.in_flight.front() {
            if !unsafe { self.device.get_fence_status(front.fence) }? {
                break;
            }
            if let Some(done) = self.in_flight.pop_front() {
                self.finish(done);
            }
        }
        Ok(match self.in_flight.front() {
            Some(pending) => pending.seq - 1,
            None => self.submitted,
        })
    }

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        unsafe { self.device.device_wait_idle() }?;
        self.retired().map(|_| ())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        while let Some(flight) = self.in_flight.pop_front() {
            self.finish(flight);
        }
        for buffer in std::mem::take(&mut self.staging) {
            self.free_buffer(buffer);
        }
        unsafe {
            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            self.device
                .destroy_descriptor_set_layout(self.empty_set_layout, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan backend destroyed");
    }
}
