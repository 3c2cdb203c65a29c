//! The default [Decoder], built on the `image` crate.
use std::io::{BufReader, Cursor, Read};

use image::imageops::FilterType;
use image::{ImageReader, Limits};

use crate::*;

const IO_BUFFER_SIZE: usize = 8 * 1024;
/// Largest single read while looking for a header.
const MAX_HEADER_CHUNK: usize = 256 * 1024;

/// Decodes PNG, JPEG and WebP streams.
///
/// If `max_alloc` is set, images which would need more memory than that fail with [LoadError::OutOfMemory] instead
/// of being decoded, which gives the loader a chance to free memory and retry.
#[derive(Clone, Debug, Default)]
pub struct ImageDecoder {
    max_alloc: Option<u64>,
}

impl ImageDecoder {
    pub fn new() -> ImageDecoder {
        Default::default()
    }

    pub fn with_max_alloc(max_alloc: u64) -> ImageDecoder {
        ImageDecoder {
            max_alloc: Some(max_alloc),
        }
    }

    fn reader(&self, reader: &mut dyn Read) -> Result<ImageReader<Cursor<Vec<u8>>>, LoadError> {
        let mut bytes = vec![];
        BufReader::with_capacity(IO_BUFFER_SIZE, reader).read_to_end(&mut bytes)?;
        let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        if let Some(max_alloc) = self.max_alloc {
            let mut limits = Limits::default();
            limits.max_alloc = Some(max_alloc);
            reader.limits(limits);
        }
        Ok(reader)
    }
}

fn header_dimensions(header: &[u8]) -> Result<Dimensions, LoadError> {
    let (width, height) = ImageReader::new(Cursor::new(header))
        .with_guessed_format()?
        .into_dimensions()?;
    Ok(Dimensions { width, height })
}

impl Decoder for ImageDecoder {
    fn decode(
        &self,
        reader: &mut dyn Read,
        options: Option<&DecodeOptions>,
        padding: Option<&PaddingSink>,
    ) -> Result<Bitmap, LoadError> {
        let decoded = self.reader(reader)?.decode()?.into_rgba8();
        let sample = options.map_or(1, |o| o.effective_sample_size());
        let pixels = if sample > 1 {
            let width = (decoded.width() / sample).max(1);
            let height = (decoded.height() / sample).max(1);
            image::imageops::resize(&decoded, width, height, FilterType::Triangle)
        } else {
            decoded
        };

        // None of the formats we decode carry nine-patch data.
        if let Some(sink) = padding {
            sink.set(Padding::default());
        }
        Ok(Bitmap::new(pixels))
    }

    /// Reads the stream in growing chunks until the header parses, so a bounds probe of a large image stops after
    /// the first few kilobytes.
    fn decode_bounds(&self, reader: &mut dyn Read) -> Result<Dimensions, LoadError> {
        let mut header = Vec::with_capacity(IO_BUFFER_SIZE);
        let mut chunk = IO_BUFFER_SIZE;
        loop {
            let read = Read::take(&mut *reader, chunk as u64).read_to_end(&mut header)?;
            let at_end = read < chunk;
            match header_dimensions(&header) {
                Ok(dims) => return Ok(dims),
                Err(e) if at_end => return Err(e),
                Err(_) => chunk = (chunk * 2).min(MAX_HEADER_CHUNK),
            }
        }
    }
}
