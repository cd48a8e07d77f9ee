//! Image layout vocabulary and sample-count selection.

use strand_protocol::{SampleCounts, TextureFormat};

/// Access state of an image as tracked on the execution thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Undefined,
    TransferDst,
    ColorAttachment,
    DepthAttachment,
    ShaderRead,
    DepthRead,
    Present,
}

impl ImageLayout {
    /// Layout an image of `format` uses while attached to a render pass.
    pub fn attachment_for(format: TextureFormat) -> Self {
        if format.is_depth() {
            Self::DepthAttachment
        } else {
            Self::ColorAttachment
        }
    }

    /// Layout an image of `format` uses while sampled by shaders.
    pub fn sampled_for(format: TextureFormat) -> Self {
        if format.is_depth() {
            Self::DepthRead
        } else {
            Self::ShaderRead
        }
    }

    pub fn is_attachment(self) -> bool {
        matches!(self, Self::ColorAttachment | Self::DepthAttachment)
    }

    pub fn is_sampleable(self) -> bool {
        matches!(self, Self::ShaderRead | Self::DepthRead)
    }
}

/// Clamps a requested sample count to one the hardware mask supports.
///
/// Returns the largest supported power of two not above `samples`, so a
/// count like 12 on a {1, 2, 4} device becomes 4. Never returns 0.
pub fn reduce_sample_count(samples: u8, mask: SampleCounts) -> u8 {
    let samples = samples.max(1);
    let floor = 7 - samples.leading_zeros();
    let allowed = (u16::from(mask.bits()) & ((2u16 << floor) - 1)) as u8;
    if allowed == 0 {
        return 1;
    }
    1 << (7 - allowed.leading_zeros())
}
