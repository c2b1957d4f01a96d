// ============================================================================
// PIXEL HELPERS – rectangle copies, fills and uniformity checks on RgbaImage
// ============================================================================
//
// Rectangles are given as (x, y, w, h) in the image's own pixels and must lie
// inside it; callers clip first.

use image::{Rgba, RgbaImage};

/// The single color filling `img`, if there is one.
///
/// Diagonals are probed first so mixed images usually bail out early.
pub fn uniform_color(img: &RgbaImage) -> Option<Rgba<u8>> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let c = *img.get_pixel(0, 0);
    for i in 0..w.min(h) {
        if *img.get_pixel(i, i) != c
            || *img.get_pixel(w - 1 - i, i) != c
            || *img.get_pixel(i, h - 1 - i) != c
            || *img.get_pixel(w - 1 - i, h - 1 - i) != c
        {
            return None;
        }
    }
    img.pixels().all(|p| *p == c).then_some(c)
}

/// True when every pixel has zero alpha.
pub fn is_fully_transparent(img: &RgbaImage) -> bool {
    img.as_raw().chunks_exact(4).all(|p| p[3] == 0)
}

/// True when every pixel of the rectangle equals `color`.
pub fn region_is(img: &RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>) -> bool {
    rows(img, x, y, w, h).all(|row| row.chunks_exact(4).all(|p| p == color.0))
}

/// True when every pixel of the rectangle has zero alpha.
pub fn region_is_transparent(img: &RgbaImage, x: u32, y: u32, w: u32, h: u32) -> bool {
    rows(img, x, y, w, h).all(|row| row.chunks_exact(4).all(|p| p[3] == 0))
}

/// The single color filling the rectangle, if there is one.
pub fn region_uniform_color(img: &RgbaImage, x: u32, y: u32, w: u32, h: u32) -> Option<Rgba<u8>> {
    if w == 0 || h == 0 {
        return None;
    }
    let c = *img.get_pixel(x, y);
    region_is(img, x, y, w, h, c).then_some(c)
}

/// Copy a rectangle of `src` into `dst` at `(dx, dy)`, replacing alpha too.
pub fn copy_region(src: &RgbaImage, sx: u32, sy: u32, w: u32, h: u32, dst: &mut RgbaImage, dx: u32, dy: u32) {
    let src_stride = src.width() as usize * 4;
    let dst_stride = dst.width() as usize * 4;
    let byte_len = w as usize * 4;
    let src_raw = src.as_raw();
    let dst_raw: &mut [u8] = dst.as_mut();
    for ly in 0..h as usize {
        let s = (sy as usize + ly) * src_stride + sx as usize * 4;
        let d = (dy as usize + ly) * dst_stride + dx as usize * 4;
        dst_raw[d..d + byte_len].copy_from_slice(&src_raw[s..s + byte_len]);
    }
}

/// Composite a rectangle of `src` over `dst` at `(dx, dy)` (source-over).
pub fn blend_region(src: &RgbaImage, sx: u32, sy: u32, w: u32, h: u32, dst: &mut RgbaImage, dx: u32, dy: u32) {
    for ly in 0..h {
        for lx in 0..w {
            let s = *src.get_pixel(sx + lx, sy + ly);
            let d = dst.get_pixel_mut(dx + lx, dy + ly);
            *d = over(s, *d);
        }
    }
}

/// Fill a rectangle with `color`, either replacing or compositing over.
pub fn fill_region(dst: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>, blend: bool) {
    for ly in y..y + h {
        for lx in x..x + w {
            let d = dst.get_pixel_mut(lx, ly);
            *d = if blend { over(color, *d) } else { color };
        }
    }
}

/// Porter-Duff source-over on straight (non-premultiplied) alpha.
fn over(src: Rgba<u8>, dst: Rgba<u8>) -> Rgba<u8> {
    let sa = src[3] as u32;
    if sa == 255 {
        return src;
    }
    if sa == 0 {
        return dst;
    }
    let da = dst[3] as u32 * (255 - sa) / 255;
    let oa = sa + da;
    if oa == 0 {
        return Rgba([0, 0, 0, 0]);
    }
    let mix = |sc: u8, dc: u8| ((sc as u32 * sa + dc as u32 * da + oa / 2) / oa).min(255) as u8;
    Rgba([mix(src[0], dst[0]), mix(src[1], dst[1]), mix(src[2], dst[2]), oa.min(255) as u8])
}

fn rows(img: &RgbaImage, x: u32, y: u32, w: u32, h: u32) -> impl Iterator<Item = &[u8]> + '_ {
    let stride = img.width() as usize * 4;
    let raw = img.as_raw();
    (y..y + h).map(move |ry| {
        let start = ry as usize * stride + x as usize * 4;
        &raw[start..start + w as usize * 4]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniformity_checks() {
        let red = Rgba([255, 0, 0, 255]);
        let mut img = RgbaImage::from_pixel(8, 4, red);
        assert_eq!(uniform_color(&img), Some(red));
        img.put_pixel(3, 1, Rgba([255, 0, 0, 254]));
        assert_eq!(uniform_color(&img), None);
        assert!(region_is(&img, 4, 0, 4, 4, red));
        assert_eq!(region_uniform_color(&img, 0, 2, 8, 2), Some(red));
        assert!(!is_fully_transparent(&img));
        assert!(is_fully_transparent(&RgbaImage::new(3, 3)));
    }

    #[test]
    fn copy_replaces_alpha() {
        let src = RgbaImage::from_fn(4, 4, |x, y| Rgba([x as u8, y as u8, 0, 0]));
        let mut dst = RgbaImage::from_pixel(6, 6, Rgba([9, 9, 9, 255]));
        copy_region(&src, 1, 1, 2, 3, &mut dst, 4, 2);
        assert_eq!(*dst.get_pixel(4, 2), Rgba([1, 1, 0, 0]));
        assert_eq!(*dst.get_pixel(5, 4), Rgba([2, 3, 0, 0]));
        assert_eq!(*dst.get_pixel(3, 2), Rgba([9, 9, 9, 255]));
        assert!(region_is_transparent(&dst, 4, 2, 2, 3));
    }

    #[test]
    fn blending_respects_alpha() {
        let mut dst = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 255, 255]));
        fill_region(&mut dst, 0, 0, 1, 1, Rgba([255, 0, 0, 0]), true);
        assert_eq!(*dst.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
        fill_region(&mut dst, 1, 0, 1, 1, Rgba([255, 0, 0, 0]), false);
        assert_eq!(*dst.get_pixel(1, 0), Rgba([255, 0, 0, 0]));

        let half = over(Rgba([255, 0, 0, 128]), Rgba([0, 0, 255, 255]));
        assert_eq!(half[3], 255);
        assert!(half[0] > 120 && half[2] > 120);
    }
}
