//! Captured frames: YUYV conversion, dark-frame rejection and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// Share of near-black pixels above which a frame is rejected.
pub const DARK_THRESHOLD: f32 = 0.95;

/// A grayscale still.
#[derive(Clone)]
pub struct Frame {
    /// One byte per pixel, row-major (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_THRESHOLD)
    }

    /// Encode as a grayscale JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let expected = (self.width * self.height) as usize;
        if self.data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.data[..expected], self.width, self.height, ExtendedColorType::L8)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y samples.
///
/// Two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// True when more than `threshold_pct` of the pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, value: u8) -> Frame {
        Frame {
            data: vec![value; (width * height) as usize],
            width,
            height,
            sequence: 0,
        }
    }

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let gray = yuyv_to_grayscale(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(is_dark_frame(&[], DARK_THRESHOLD));
        assert!(frame(10, 10, 0).is_dark());
        assert!(!frame(10, 10, 128).is_dark());

        // 94% dark is still usable
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, DARK_THRESHOLD));
    }

    #[test]
    fn test_avg_brightness() {
        assert_eq!(frame(4, 4, 200).avg_brightness(), 200.0);
        assert_eq!(frame(0, 0, 0).avg_brightness(), 0.0);
    }

    #[test]
    fn test_to_jpeg_has_soi_marker() {
        let jpeg = frame(16, 16, 90).to_jpeg(85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn test_to_jpeg_short_buffer() {
        let mut f = frame(8, 8, 50);
        f.data.truncate(10);
        assert!(matches!(f.to_jpeg(80), Err(FrameError::InvalidLength { .. })));
    }
}
