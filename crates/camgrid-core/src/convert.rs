//! Frame downscaling done on the capture thread.
//!
//! Shrinking before publish keeps the render loop's per-frame cost bounded
//! regardless of what resolution the camera negotiated.

use crate::frame::Frame;

/// Target size for a frame whose longest edge exceeds `max_dim`.
///
/// Returns `None` when the frame already fits. Aspect ratio is preserved and
/// neither edge collapses to zero.
pub fn scaled_dimensions(width: u32, height: u32, max_dim: u32) -> Option<(u32, u32)> {
    if max_dim == 0 || (width <= max_dim && height <= max_dim) {
        return None;
    }
    let scale = max_dim as f64 / width.max(height) as f64;
    let w = ((width as f64 * scale) as u32).max(1);
    let h = ((height as f64 * scale) as u32).max(1);
    Some((w, h))
}

/// Nearest-neighbour resize of a packed buffer.
///
/// `bpp` is bytes per pixel. Picks the source pixel at the top-left of each
/// destination cell, like a 2x2 block sample generalized to any ratio.
pub fn downsample_nearest(
    src: &[u8],
    width: usize,
    height: usize,
    bpp: usize,
    dst_width: usize,
    dst_height: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_width * dst_height * bpp];

    for row in 0..dst_height {
        let src_row = row * height / dst_height;
        for col in 0..dst_width {
            let src_col = col * width / dst_width;
            let s = (src_row * width + src_col) * bpp;
            let d = (row * dst_width + col) * bpp;
            dst[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
        }
    }

    dst
}

/// Shrink a frame so its longest edge is at most `max_dim`.
///
/// Compressed or planar-subsampled formats, and buffers whose size does not
/// match their header, are returned untouched.
pub fn downsample_frame(frame: Frame, max_dim: u32) -> Frame {
    let Some((dst_w, dst_h)) = scaled_dimensions(frame.width, frame.height, max_dim) else {
        return frame;
    };
    let bpp = match frame.format.bytes_per_pixel() {
        Some(bpp) if frame.format != crate::frame::PixelFormat::Yuyv => bpp,
        _ => return frame,
    };
    let (w, h) = (frame.width as usize, frame.height as usize);
    if frame.data.len() < w * h * bpp {
        return frame;
    }

    let data = downsample_nearest(&frame.data, w, h, bpp, dst_w as usize, dst_h as usize);
    Frame {
        data,
        width: dst_w,
        height: dst_h,
        ..frame
    }
}
