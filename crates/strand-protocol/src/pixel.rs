//! CPU-side pixel data handed to texture uploads.

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelDataFormat {
    R,
    RInteger,
    Rg,
    RgInteger,
    Rgb,
    RgbInteger,
    Rgba,
    RgbaInteger,
    DepthComponent,
    DepthStencil,
    Alpha,
}

impl PixelDataFormat {
    pub fn components(self) -> usize {
        match self {
            Self::R | Self::RInteger | Self::DepthComponent | Self::Alpha => 1,
            Self::Rg | Self::RgInteger | Self::DepthStencil => 2,
            Self::Rgb | Self::RgbInteger => 3,
            Self::Rgba | Self::RgbaInteger => 4,
        }
    }
}

/// Component type of uncompressed pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelDataType {
    UByte,
    Byte,
    UShort,
    Short,
    UInt,
    Int,
    Half,
    Float,
    /// Packed R11G11B10F, RGB only.
    UInt10F11F11FRev,
    /// Packed A2B10G10R10, RGBA only.
    UInt2101010Rev,
    /// Packed R5G6B5, RGB only.
    UShort565,
    /// Block-compressed; only reported by [`PixelLayout::Compressed`].
    Compressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressedPixelDataType {
    Etc2Rgb8,
    Etc2Rgba8,
    Bc1Rgb,
    Bc3Rgba,
    Bc7Rgba,
    Astc4x4Rgba,
}

/// How the bytes of a [`PixelBufferDescriptor`] are laid out.
///
/// Whether data is compressed is carried by the variant itself, so the
/// compressed pixel type can never be paired with a row stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    Uncompressed {
        format: PixelDataFormat,
        ty: PixelDataType,
        /// Row stride in pixels; 0 means tightly packed.
        stride: u32,
        /// Row alignment in bytes, a power of two.
        alignment: u8,
        left: u32,
        top: u32,
    },
    Compressed {
        format: CompressedPixelDataType,
        image_size: u32,
    },
}

/// Owned pixel data plus its layout. Ownership moves into the command that uploads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBufferDescriptor {
    pub data: Vec<u8>,
    pub layout: PixelLayout,
}

impl PixelBufferDescriptor {
    /// Tightly packed uncompressed pixels with 1-byte row alignment.
    pub fn new(data: Vec<u8>, format: PixelDataFormat, ty: PixelDataType) -> Self {
        Self {
            data,
            layout: PixelLayout::Uncompressed {
                format,
                ty,
                stride: 0,
                alignment: 1,
                left: 0,
                top: 0,
            },
        }
    }

    pub fn compressed(data: Vec<u8>, format: CompressedPixelDataType) -> Self {
        let image_size = data.len() as u32;
        Self {
            data,
            layout: PixelLayout::Compressed { format, image_size },
        }
    }

    pub fn pixel_type(&self) -> PixelDataType {
        match self.layout {
            PixelLayout::Uncompressed { ty, .. } => ty,
            PixelLayout::Compressed { .. } => PixelDataType::Compressed,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.layout, PixelLayout::Compressed { .. })
    }

    /// Checks the layout is self-consistent and the data is large enough for a
    /// `width` x `height` region.
    pub fn validate(&self, width: u32, height: u32) -> Result<(), ProtocolError> {
        match self.layout {
            PixelLayout::Uncompressed {
                format,
                ty,
                stride,
                alignment,
                ..
            } => {
                if ty == PixelDataType::Compressed {
                    return Err(ProtocolError::InconsistentLayout(
                        "compressed pixel type in an uncompressed layout".to_string(),
                    ));
                }
                if alignment == 0 || !alignment.is_power_of_two() {
                    return Err(ProtocolError::InvalidAlignment(alignment));
                }
                let stride = if stride == 0 { width } else { stride };
                let required = compute_data_size(
                    format,
                    ty,
                    stride as usize,
                    height as usize,
                    alignment as usize,
                )?;
                if self.data.len() < required {
                    return Err(ProtocolError::BufferTooSmall {
                        required,
                        actual: self.data.len(),
                    });
                }
                Ok(())
            }
            PixelLayout::Compressed { image_size, .. } => {
                if self.data.len() < image_size as usize {
                    return Err(ProtocolError::BufferTooSmall {
                        required: image_size as usize,
                        actual: self.data.len(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Size in bytes of one pixel.
pub fn compute_pixel_size(
    format: PixelDataFormat,
    ty: PixelDataType,
) -> Result<usize, ProtocolError> {
    let n = format.components();
    let bpp = match ty {
        PixelDataType::Compressed => return Ok(0),
        PixelDataType::UByte | PixelDataType::Byte => n,
        PixelDataType::UShort | PixelDataType::Short | PixelDataType::Half => n * 2,
        PixelDataType::UInt | PixelDataType::Int | PixelDataType::Float => n * 4,
        PixelDataType::UInt10F11F11FRev => {
            if format != PixelDataFormat::Rgb {
                return Err(ProtocolError::InconsistentLayout(
                    "R11G11B10F requires the RGB format".to_string(),
                ));
            }
            4
        }
        PixelDataType::UInt2101010Rev => {
            if format != PixelDataFormat::Rgba {
                return Err(ProtocolError::InconsistentLayout(
                    "A2B10G10R10 requires the RGBA format".to_string(),
                ));
            }
            4
        }
        PixelDataType::UShort565 => {
            if format != PixelDataFormat::Rgb {
                return Err(ProtocolError::InconsistentLayout(
                    "R5G6B5 requires the RGB format".to_string(),
                ));
            }
            2
        }
    };
    Ok(bpp)
}

/// Bytes needed for `height` rows of `stride` pixels with rows padded to `alignment`.
pub fn compute_data_size(
    format: PixelDataFormat,
    ty: PixelDataType,
    stride: usize,
    height: usize,
    alignment: usize,
) -> Result<usize, ProtocolError> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(ProtocolError::InvalidAlignment(alignment.min(u8::MAX as usize) as u8));
    }
    let bpr = compute_pixel_size(format, ty)? * stride;
    let bpr_aligned = (bpr + (alignment - 1)) & !(alignment - 1);
    Ok(bpr_aligned * height)
}
