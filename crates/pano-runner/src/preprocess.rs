use crate::services::ServiceError;
use image::imageops::{self, FilterType};

pub const CLIP_INPUT_SIZE: u32 = 224;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
}

impl ImageTensor {
    pub const SHAPE: [usize; 4] = [1, 3, CLIP_INPUT_SIZE as usize, CLIP_INPUT_SIZE as usize];

    pub fn from_raw(data: Vec<f32>) -> Result<Self, ServiceError> {
        let expected: usize = Self::SHAPE.iter().product();
        if data.len() != expected {
            return Err(ServiceError::Preprocess(format!(
                "tensor holds {} values, expected {}",
                data.len(),
                expected
            )));
        }
        Ok(Self { data })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

pub fn preprocess_for_clip(png: &[u8]) -> Result<ImageTensor, ServiceError> {
    let img = image::load_from_memory(png)
        .map_err(|e| ServiceError::Preprocess(format!("cannot decode capture: {}", e)))?;
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(ServiceError::Preprocess("capture has no pixels".to_string()));
    }

    let scale = f64::from(CLIP_INPUT_SIZE) / f64::from(width.min(height));
    let scaled_w = ((f64::from(width) * scale).round() as u32).max(CLIP_INPUT_SIZE);
    let scaled_h = ((f64::from(height) * scale).round() as u32).max(CLIP_INPUT_SIZE);
    let resized = img
        .resize_exact(scaled_w, scaled_h, FilterType::CatmullRom)
        .to_rgb8();
    let left = (scaled_w - CLIP_INPUT_SIZE) / 2;
    let top = (scaled_h - CLIP_INPUT_SIZE) / 2;
    let cropped = imageops::crop_imm(&resized, left, top, CLIP_INPUT_SIZE, CLIP_INPUT_SIZE).to_image();

    let side = CLIP_INPUT_SIZE as usize;
    let plane = side * side;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in cropped.enumerate_pixels() {
        let offset = y as usize * side + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = (f32::from(pixel[c]) / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    ImageTensor::from_raw(data)
}
