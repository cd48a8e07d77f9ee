//! Conversion between the engine's top-left origin and bottom-left native
//! origins. Pure functions of the rectangle and framebuffer size.

use strand_protocol::Rect2D;

/// Flips a viewport vertically: `y' = fb_height - y - height`.
pub fn flip_viewport(rect: Rect2D, fb_height: u32) -> Rect2D {
    let y = fb_height as i64 - rect.y as i64 - rect.height as i64;
    Rect2D {
        y: y as i32,
        ..rect
    }
}

/// Flips a scissor rectangle and clamps it to the framebuffer bounds.
/// A rectangle entirely outside yields a zero-sized scissor.
pub fn clamp_scissor(rect: Rect2D, fb_width: u32, fb_height: u32) -> Rect2D {
    let (fb_w, fb_h) = (fb_width as i64, fb_height as i64);
    let flipped_y = fb_h - rect.y as i64 - rect.height as i64;

    let x = (rect.x as i64).max(0);
    let y = flipped_y.max(0);
    let right = (rect.x as i64 + rect.width as i64).min(fb_w);
    let top = (flipped_y + rect.height as i64).min(fb_h);

    Rect2D {
        x: x.min(fb_w) as i32,
        y: y.min(fb_h) as i32,
        width: (right - x).max(0) as u32,
        height: (top - y).max(0) as u32,
    }
}
