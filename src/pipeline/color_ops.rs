use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbImage};

pub const MASK_ON: u8 = 255;
pub const MASK_OFF: u8 = 0;

/// Inclusive bounds on 8-bit HSV with hue in `0..=179` (half degrees).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

/// Blue/purple band the segmentation visualisation paints the selected
/// region with. Must stay in sync with the remote renderer.
pub const SEGMENTATION_HIGHLIGHT: HsvRange = HsvRange {
    lower: [100, 50, 50],
    upper: [140, 255, 255],
};

impl HsvRange {
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|i| hsv[i] >= self.lower[i] && hsv[i] <= self.upper[i])
    }
}

/// 8-bit RGB to HSV with OpenCV's `COLOR_RGB2HSV` conventions: V is the max
/// channel, S is scaled to 255, H is degrees halved into `0..=179`.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;

    let s = if v == 0 {
        0
    } else {
        round_div(diff * 255, v)
    };
    if diff == 0 {
        return [0, s as u8, v as u8];
    }

    // R wins ties, then G.
    let sector = if v == r {
        g - b
    } else if v == g {
        b - r + 2 * diff
    } else {
        r - g + 4 * diff
    };
    let mut h = round_div(sector * 30, diff);
    if h < 0 {
        h += 180;
    }
    if h >= 180 {
        h -= 180;
    }
    [h as u8, s as u8, v as u8]
}

fn round_div(num: i32, den: i32) -> i32 {
    let q = f64::from(num) / f64::from(den);
    q.round() as i32
}

/// Binary mask of pixels whose HSV falls inside `range`.
pub fn hsv_in_range_mask(image: &RgbImage, range: &HsvRange) -> GrayImage {
    let mut mask = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let hsv = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
        if range.contains(hsv) {
            mask.put_pixel(x, y, Luma([MASK_ON]));
        }
    }
    mask
}

/// Filled disc centred at `(width / 2, height / 2)` with radius
/// `min(width, height) / 4`, zero elsewhere.
pub fn centered_ellipse_mask(width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    let cx = i64::from(width / 2);
    let cy = i64::from(height / 2);
    let radius = i64::from(width.min(height) / 4);
    let r2 = radius * radius;
    for (x, y, pixel) in mask.enumerate_pixels_mut() {
        let dx = i64::from(x) - cx;
        let dy = i64::from(y) - cy;
        if dx * dx + dy * dy <= r2 {
            *pixel = Luma([MASK_ON]);
        }
    }
    mask
}

/// Single-channel, binary, exactly `width`x`height`.
pub fn coerce_mask(mask: &DynamicImage, width: u32, height: u32) -> GrayImage {
    let gray = mask.to_luma8();
    let mut sized = if gray.dimensions() == (width, height) {
        gray
    } else {
        imageops::resize(&gray, width, height, FilterType::Nearest)
    };
    for pixel in sized.pixels_mut() {
        pixel[0] = if pixel[0] > 127 { MASK_ON } else { MASK_OFF };
    }
    sized
}

/// Downscales proportionally so the longer side is at most `max_dimension`.
/// Images already within the cap are returned untouched.
pub fn fit_within(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if longest <= max_dimension || max_dimension == 0 {
        return image;
    }
    let scale = f64::from(max_dimension) / f64::from(longest);
    let new_w = ((f64::from(width) * scale).round() as u32).max(1);
    let new_h = ((f64::from(height) * scale).round() as u32).max(1);
    image.resize_exact(new_w, new_h, FilterType::Lanczos3)
}

pub fn mask_coverage(mask: &GrayImage) -> f64 {
    let total = u64::from(mask.width()) * u64::from(mask.height());
    if total == 0 {
        return 0.0;
    }
    let on = mask.pixels().filter(|p| p[0] == MASK_ON).count() as f64;
    on / total as f64
}
