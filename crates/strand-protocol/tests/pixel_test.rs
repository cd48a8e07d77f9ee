//! Integration test: pixel buffer descriptors
//!
//! Run with: cargo test -p strand-protocol --test pixel_test

use strand_protocol::*;

#[test]
fn test_pixel_sizes() {
    assert_eq!(compute_pixel_size(PixelDataFormat::Rgba, PixelDataType::UByte), Ok(4));
    assert_eq!(compute_pixel_size(PixelDataFormat::Rgb, PixelDataType::Half), Ok(6));
    assert_eq!(compute_pixel_size(PixelDataFormat::Rg, PixelDataType::Float), Ok(8));
    assert_eq!(
        compute_pixel_size(PixelDataFormat::Rgb, PixelDataType::UInt10F11F11FRev),
        Ok(4)
    );
    assert_eq!(compute_pixel_size(PixelDataFormat::Rgb, PixelDataType::UShort565), Ok(2));
    assert!(compute_pixel_size(PixelDataFormat::Rgba, PixelDataType::UShort565).is_err());
}

#[test]
fn test_data_size_pads_rows_to_alignment() {
    // 3 RGB bytes * 5 pixels = 15 bytes per row, padded to 16.
    assert_eq!(
        compute_data_size(PixelDataFormat::Rgb, PixelDataType::UByte, 5, 4, 4),
        Ok(64)
    );
    assert_eq!(
        compute_data_size(PixelDataFormat::Rgb, PixelDataType::UByte, 5, 4, 1),
        Ok(60)
    );
    assert_eq!(
        compute_data_size(PixelDataFormat::Rgba, PixelDataType::UByte, 5, 4, 3),
        Err(ProtocolError::InvalidAlignment(3))
    );
}

#[test]
fn test_validate_checks_length() {
    let ok = PixelBufferDescriptor::new(vec![0; 16 * 16 * 4], PixelDataFormat::Rgba, PixelDataType::UByte);
    assert_eq!(ok.validate(16, 16), Ok(()));
    assert!(!ok.is_compressed());
    assert_eq!(ok.pixel_type(), PixelDataType::UByte);

    let short = PixelBufferDescriptor::new(vec![0; 100], PixelDataFormat::Rgba, PixelDataType::UByte);
    assert_eq!(
        short.validate(16, 16),
        Err(ProtocolError::BufferTooSmall {
            required: 1024,
            actual: 100
        })
    );
}

#[test]
fn test_compressed_layout_reports_compressed_type() {
    let blocks = PixelBufferDescriptor::compressed(vec![0; 128], CompressedPixelDataType::Bc7Rgba);
    assert!(blocks.is_compressed());
    assert_eq!(blocks.pixel_type(), PixelDataType::Compressed);
    assert_eq!(blocks.validate(16, 16), Ok(()));

    let inconsistent = PixelBufferDescriptor {
        data: vec![0; 64],
        layout: PixelLayout::Uncompressed {
            format: PixelDataFormat::Rgba,
            ty: PixelDataType::Compressed,
            stride: 0,
            alignment: 1,
            left: 0,
            top: 0,
        },
    };
    assert!(matches!(
        inconsistent.validate(4, 4),
        Err(ProtocolError::InconsistentLayout(_))
    ));
}
