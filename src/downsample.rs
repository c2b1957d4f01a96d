// ============================================================================
// DOWNSAMPLE – 4:1 alpha-weighted box filter between zoom levels
// ============================================================================

use image::RgbaImage;
use rayon::prelude::*;

use crate::coords::ZOOM_STEP;

const STEP: u32 = ZOOM_STEP as u32;

/// Reduce `src` to a quarter of its size along each axis.
///
/// Each output pixel averages its 4×4 source window (smaller on ragged
/// right/bottom edges). Alpha is a plain mean; color channels are weighted by
/// alpha so transparent pixels never darken the result. A window with no
/// coverage at all yields `[0, 0, 0, 0]`.
pub fn downsample(src: &RgbaImage) -> RgbaImage {
    let (sw, sh) = src.dimensions();
    let dw = sw.div_ceil(STEP);
    let dh = sh.div_ceil(STEP);
    if dw == 0 || dh == 0 {
        return RgbaImage::new(dw, dh);
    }

    let src_raw = src.as_raw();
    let src_stride = sw as usize * 4;
    let mut out = vec![0u8; dw as usize * dh as usize * 4];

    out.par_chunks_mut(dw as usize * 4)
        .enumerate()
        .for_each(|(dy, row)| {
            let sy0 = dy as u32 * STEP;
            let sy1 = (sy0 + STEP).min(sh);
            for dx in 0..dw {
                let sx0 = dx * STEP;
                let sx1 = (sx0 + STEP).min(sw);

                let (mut a, mut r, mut g, mut b, mut n) = (0u32, 0u32, 0u32, 0u32, 0u32);
                for sy in sy0..sy1 {
                    let line = &src_raw[sy as usize * src_stride..];
                    for sx in sx0..sx1 {
                        let p = &line[sx as usize * 4..sx as usize * 4 + 4];
                        let pa = p[3] as u32;
                        a += pa;
                        r += p[0] as u32 * pa;
                        g += p[1] as u32 * pa;
                        b += p[2] as u32 * pa;
                        n += 1;
                    }
                }

                let o = dx as usize * 4;
                if a != 0 {
                    let half = a / 2;
                    row[o] = ((r + half) / a).min(255) as u8;
                    row[o + 1] = ((g + half) / a).min(255) as u8;
                    row[o + 2] = ((b + half) / a).min(255) as u8;
                }
                row[o + 3] = ((a + n / 2) / n).min(255) as u8;
            }
        });

    // Buffer length is dw*dh*4 by construction.
    RgbaImage::from_raw(dw, dh, out).unwrap_or_else(|| RgbaImage::new(dw, dh))
}
