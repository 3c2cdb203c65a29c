//! Stock [Transform]s.
use image::imageops::{self, FilterType};

use crate::*;

/// Scale to exactly `width` x `height`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Resize {
        Resize { width, height }
    }
}

impl Transform for Resize {
    fn id(&self) -> String {
        format!("r{}x{}", self.width, self.height)
    }

    fn apply(&self, input: Bitmap) -> Result<Bitmap, LoadError> {
        if self.width == 0 || self.height == 0 {
            return Err(LoadError::Transform {
                id: self.id(),
                reason: "target size must be non-zero".into(),
            });
        }
        if input.width() == self.width && input.height() == self.height {
            return Ok(input);
        }
        let out = imageops::resize(input.as_rgba(), self.width, self.height, FilterType::Triangle);
        Ok(Bitmap::new(out))
    }
}

/// Clockwise rotation by a quarter-turn multiple.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rotate {
    Quarter,
    Half,
    ThreeQuarters,
}

impl Rotate {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotate::Quarter => 90,
            Rotate::Half => 180,
            Rotate::ThreeQuarters => 270,
        }
    }

    /// `None` unless `degrees` is a non-zero multiple of 90 (mod 360).
    pub fn from_degrees(degrees: i32) -> Option<Rotate> {
        match degrees.rem_euclid(360) {
            90 => Some(Rotate::Quarter),
            180 => Some(Rotate::Half),
            270 => Some(Rotate::ThreeQuarters),
            _ => None,
        }
    }
}

impl Transform for Rotate {
    fn id(&self) -> String {
        format!("ro{}", self.degrees())
    }

    fn apply(&self, input: Bitmap) -> Result<Bitmap, LoadError> {
        let out = match self {
            Rotate::Quarter => imageops::rotate90(input.as_rgba()),
            Rotate::Half => {
                let mut input = input;
                imageops::rotate180_in_place(input.as_rgba_mut());
                return Ok(input);
            }
            Rotate::ThreeQuarters => imageops::rotate270(input.as_rgba()),
        };
        Ok(Bitmap::new(out))
    }
}

/// Scale color saturation.  0 is grayscale, 1 leaves the image alone, above 1 oversaturates.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Saturation(pub f32);

// Luminance weights used for the gray point.
const LUMA_R: f32 = 0.213;
const LUMA_G: f32 = 0.715;
const LUMA_B: f32 = 0.072;

impl Transform for Saturation {
    fn id(&self) -> String {
        format!("saturation{}", self.0)
    }

    fn apply(&self, input: Bitmap) -> Result<Bitmap, LoadError> {
        let mut out = input;
        let s = self.0;
        for px in out.as_rgba_mut().pixels_mut() {
            let [r, g, b, _] = px.0;
            let (r, g, b) = (r as f32, g as f32, b as f32);
            let luma = LUMA_R * r + LUMA_G * g + LUMA_B * b;
            let mix = |c: f32| (luma + s * (c - luma)).round().clamp(0.0, 255.0) as u8;
            px.0[0] = mix(r);
            px.0[1] = mix(g);
            px.0[2] = mix(b);
        }
        Ok(out)
    }
}

/// Horizontal flip.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Mirror;

impl Transform for Mirror {
    fn id(&self) -> String {
        "i".to_string()
    }

    fn apply(&self, input: Bitmap) -> Result<Bitmap, LoadError> {
        let mut out = input;
        imageops::flip_horizontal_in_place(out.as_rgba_mut());
        Ok(out)
    }
}
