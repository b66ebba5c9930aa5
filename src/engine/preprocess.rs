//! Frame preprocessing for the detection and age models

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb};
use ndarray::Array4;

use crate::camera::Frame;

/// Standard input size for face detection (SCRFD)
pub const DETECTOR_INPUT_SIZE: (u32, u32) = (640, 640);

/// Standard input size for the age model
pub const AGE_INPUT_SIZE: (u32, u32) = (96, 96);

/// Wrap a raw camera frame as an image without copying channel order.
pub fn frame_to_image(frame: &Frame) -> Result<DynamicImage> {
    let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.rgb.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Preprocess a frame for the detection model: letterbox to 640x640 and
/// convert to a normalized NCHW tensor.
pub fn preprocess_for_detection(image: &DynamicImage) -> Result<Array4<f32>> {
    let (target_w, target_h) = DETECTOR_INPUT_SIZE;
    let resized = resize_with_padding(image, target_w, target_h);
    Ok(image_to_nchw(&resized))
}

/// Preprocess a cropped face for the age model.
pub fn preprocess_for_age(face_image: &DynamicImage) -> Result<Array4<f32>> {
    let (target_w, target_h) = AGE_INPUT_SIZE;
    let resized =
        face_image.resize_exact(target_w, target_h, image::imageops::FilterType::Lanczos3);
    Ok(image_to_nchw(&resized))
}

/// Resize with aspect ratio preserved, centering on a black canvas.
fn resize_with_padding(image: &DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let (orig_w, orig_h) = image.dimensions();

    let scale = f32::min(
        target_w as f32 / orig_w as f32,
        target_h as f32 / orig_h as f32,
    );
    let new_w = (orig_w as f32 * scale) as u32;
    let new_h = (orig_h as f32 * scale) as u32;

    let resized = image.resize_exact(new_w, new_h, image::imageops::FilterType::Lanczos3);

    let mut padded = ImageBuffer::from_pixel(target_w, target_h, Rgb([0u8, 0, 0]));
    let offset_x = (target_w - new_w) / 2;
    let offset_y = (target_h - new_h) / 2;

    let rgb_image = resized.to_rgb8();
    for y in 0..new_h {
        for x in 0..new_w {
            let pixel = rgb_image.get_pixel(x, y);
            padded.put_pixel(x + offset_x, y + offset_y, *pixel);
        }
    }

    DynamicImage::ImageRgb8(padded)
}

/// Convert to NCHW normalized to [-1, 1]. InsightFace models expect BGR
/// channel order.
fn image_to_nchw(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for y in 0..height {
        for x in 0..width {
            let pixel = rgb.get_pixel(x, y);
            let (r, g, b) = (pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
            tensor[[0, 0, y as usize, x as usize]] = (b - 127.5) / 128.0;
            tensor[[0, 1, y as usize, x as usize]] = (g - 127.5) / 128.0;
            tensor[[0, 2, y as usize, x as usize]] = (r - 127.5) / 128.0;
        }
    }

    tensor
}

/// Extract a face region with a relative margin on every side.
pub fn crop_face(image: &DynamicImage, bounds: [f32; 4], margin: f32) -> DynamicImage {
    let (img_w, img_h) = image.dimensions();
    let [x, y, w, h] = bounds;

    let margin_x = w * margin;
    let margin_y = h * margin;

    let x1 = (x - margin_x).max(0.0) as u32;
    let y1 = (y - margin_y).max(0.0) as u32;
    let x2 = (x + w + margin_x).min(img_w as f32) as u32;
    let y2 = (y + h + margin_y).min(img_h as f32) as u32;

    image.crop_imm(x1, y1, (x2 - x1).max(1), (y2 - y1).max(1))
}

/// Letterbox geometry for mapping detections back to frame coordinates.
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w as f32,
            target_h as f32 / orig_h as f32,
        );

        let new_w = (orig_w as f32 * scale) as u32;
        let new_h = (orig_h as f32 * scale) as u32;

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    /// Convert detection coordinates back to original frame space.
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: u32, height: u32) -> Frame {
        Frame {
            width,
            height,
            rgb: vec![127; (width * height * 3) as usize],
        }
    }

    #[test]
    fn test_frame_to_image_dimensions() {
        let image = frame_to_image(&gray_frame(320, 240)).unwrap();
        assert_eq!(image.dimensions(), (320, 240));
    }

    #[test]
    fn test_frame_to_image_rejects_short_buffer() {
        let mut frame = gray_frame(320, 240);
        frame.rgb.truncate(10);
        assert!(frame_to_image(&frame).is_err());
    }

    #[test]
    fn test_resize_info_round_trip() {
        let info = ResizeInfo::new((1280, 720), DETECTOR_INPUT_SIZE);
        // 1280x720 letterboxed into 640x640 scales by 0.5 and pads
        // vertically.
        assert!((info.scale - 0.5).abs() < 1e-6);
        assert_eq!(info.offset_x, 0);
        assert_eq!(info.offset_y, 140);

        let (x, y) = info.to_original(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 360.0).abs() < 1e-3);
    }

    #[test]
    fn test_crop_face_clamps_to_frame() {
        let image = frame_to_image(&gray_frame(100, 100)).unwrap();
        let cropped = crop_face(&image, [90.0, 90.0, 20.0, 20.0], 0.2);
        let (w, h) = cropped.dimensions();
        assert!(w <= 100 && h <= 100);
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn test_detection_tensor_shape_and_range() {
        let image = frame_to_image(&gray_frame(320, 240)).unwrap();
        let tensor = preprocess_for_detection(&image).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        for v in tensor.iter() {
            assert!(*v >= -1.0 && *v <= 1.0);
        }
    }
}
