use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat};

/// Opens an image file and normalises it to RGB8, the working format of the
/// whole pipeline.
pub fn open_rgb(path: &Path) -> Result<DynamicImage, image::ImageError> {
    Ok(DynamicImage::ImageRgb8(image::open(path)?.to_rgb8()))
}

pub fn decode_rgb(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    Ok(DynamicImage::ImageRgb8(
        image::load_from_memory(bytes)?.to_rgb8(),
    ))
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
