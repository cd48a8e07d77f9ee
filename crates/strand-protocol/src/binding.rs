//! Descriptor-set layout descriptions and their bitmask form.

use bitflags::bitflags;

/// Highest binding slot a layout may declare, exclusive.
pub const MAX_BINDINGS: u8 = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u8 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    /// Uniform buffer whose offset is supplied at bind time.
    DynamicUniformBuffer,
    Sampler,
    /// Externally produced image (camera/video stream).
    ExternalSampler,
    InputAttachment,
    StorageBuffer,
}

impl BindingKind {
    pub fn is_buffer(self) -> bool {
        matches!(
            self,
            Self::UniformBuffer | Self::DynamicUniformBuffer | Self::StorageBuffer
        )
    }

    pub fn is_texture(self) -> bool {
        matches!(self, Self::Sampler | Self::ExternalSampler | Self::InputAttachment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SetLayoutBinding {
    pub binding: u8,
    pub kind: BindingKind,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SetLayoutDescriptor {
    pub bindings: Vec<SetLayoutBinding>,
}

impl SetLayoutDescriptor {
    pub fn binding(&self, slot: u8) -> Option<&SetLayoutBinding> {
        self.bindings.iter().find(|b| b.binding == slot)
    }
}

/// Layout folded into one bitset per binding kind, indexed by slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LayoutMask {
    pub uniform: u32,
    pub dynamic_uniform: u32,
    pub sampler: u32,
    pub external_sampler: u32,
    pub input_attachment: u32,
    pub storage: u32,
    pub vertex_stages: u32,
    pub fragment_stages: u32,
    pub compute_stages: u32,
}

impl LayoutMask {
    pub fn from_descriptor(descriptor: &SetLayoutDescriptor) -> Self {
        let mut mask = Self::default();
        for binding in &descriptor.bindings {
            assert!(
                binding.binding < MAX_BINDINGS,
                "binding slot {} exceeds the maximum of {}",
                binding.binding,
                MAX_BINDINGS - 1
            );
            let bit = 1u32 << binding.binding;
            match binding.kind {
                BindingKind::UniformBuffer => mask.uniform |= bit,
                BindingKind::DynamicUniformBuffer => mask.dynamic_uniform |= bit,
                BindingKind::ExternalSampler => {
                    // External images fall back to the generic sampler path.
                    mask.external_sampler |= bit;
                    mask.sampler |= bit;
                }
                BindingKind::Sampler => mask.sampler |= bit,
                BindingKind::InputAttachment => mask.input_attachment |= bit,
                BindingKind::StorageBuffer => mask.storage |= bit,
            }
            if binding.stages.contains(ShaderStages::VERTEX) {
                mask.vertex_stages |= bit;
            }
            if binding.stages.contains(ShaderStages::FRAGMENT) {
                mask.fragment_stages |= bit;
            }
            if binding.stages.contains(ShaderStages::COMPUTE) {
                mask.compute_stages |= bit;
            }
        }
        mask
    }

    /// Every slot declared by the layout.
    pub fn slots(&self) -> u32 {
        self.uniform | self.dynamic_uniform | self.sampler | self.input_attachment | self.storage
    }

    pub fn counts(&self) -> DescriptorCounts {
        DescriptorCounts {
            uniform: self.uniform.count_ones(),
            dynamic_uniform: self.dynamic_uniform.count_ones(),
            sampler: self.sampler.count_ones(),
            input_attachment: self.input_attachment.count_ones(),
            storage: self.storage.count_ones(),
        }
    }

    pub fn stages_of(&self, slot: u8) -> ShaderStages {
        let bit = 1u32 << slot;
        let mut stages = ShaderStages::empty();
        if self.vertex_stages & bit != 0 {
            stages |= ShaderStages::VERTEX;
        }
        if self.fragment_stages & bit != 0 {
            stages |= ShaderStages::FRAGMENT;
        }
        if self.compute_stages & bit != 0 {
            stages |= ShaderStages::COMPUTE;
        }
        stages
    }

    /// The kind the slot was declared with, resolving the external-sampler alias.
    pub fn kind_of(&self, slot: u8) -> Option<BindingKind> {
        let bit = 1u32 << slot;
        if self.external_sampler & bit != 0 {
            Some(BindingKind::ExternalSampler)
        } else if self.sampler & bit != 0 {
            Some(BindingKind::Sampler)
        } else if self.dynamic_uniform & bit != 0 {
            Some(BindingKind::DynamicUniformBuffer)
        } else if self.uniform & bit != 0 {
            Some(BindingKind::UniformBuffer)
        } else if self.input_attachment & bit != 0 {
            Some(BindingKind::InputAttachment)
        } else if self.storage & bit != 0 {
            Some(BindingKind::StorageBuffer)
        } else {
            None
        }
    }
}

/// Per-kind descriptor counts used to size native pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DescriptorCounts {
    pub uniform: u32,
    pub dynamic_uniform: u32,
    pub sampler: u32,
    pub input_attachment: u32,
    pub storage: u32,
}

impl DescriptorCounts {
    pub fn scaled(&self, sets: u32) -> Self {
        Self {
            uniform: self.uniform * sets,
            dynamic_uniform: self.dynamic_uniform * sets,
            sampler: self.sampler * sets,
            input_attachment: self.input_attachment * sets,
            storage: self.storage * sets,
        }
    }
}
