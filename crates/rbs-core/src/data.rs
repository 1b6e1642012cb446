//! Camera frame type.

use chrono::{DateTime, Utc};

/// Pixel layout of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One 8-bit luminance byte per pixel.
    Gray8,
    /// Three bytes per pixel, red first.
    Rgb8,
}

impl PixelFormat {
    /// Bytes per pixel.
    #[must_use]
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// A single camera frame.
///
/// Frames are copied out of a camera's latest-frame slot, so readers always
/// own their data and never observe the acquisition buffer being rewritten.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Pixel layout of `data`
    pub format: PixelFormat,

    /// Raw pixel data, row-major without padding
    pub data: Vec<u8>,

    /// When the frame was read from the device
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Create an 8-bit grayscale frame.
    pub fn gray(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Gray8,
            data,
            captured_at: Utc::now(),
        }
    }

    /// Create an RGB frame.
    pub fn rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Rgb8,
            data,
            captured_at: Utc::now(),
        }
    }

    /// Whether the buffer length matches the declared geometry.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let expected = self.width as usize * self.height as usize * self.format.channels();
        self.width > 0 && self.height > 0 && self.data.len() == expected
    }

    /// Uniform mid-gray frame handed to streaming consumers before a camera
    /// has produced anything.
    pub fn placeholder(width: u32, height: u32) -> Self {
        Self::gray(width, height, vec![128; width as usize * height as usize])
    }
}
