//! JPEG payload encoding for the mailbox region.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};

use crate::capture::decoder::{self, DecodeError};
use crate::capture::frame::{Frame, CHANNELS};

use super::MailboxError;

/// Compress a BGR frame to JPEG. `quality` is clamped to 1..=100.
pub fn encode(frame: &Frame, quality: u8) -> Result<Vec<u8>, MailboxError> {
    if frame.channels != CHANNELS {
        return Err(MailboxError::Encode(format!(
            "expected {CHANNELS} channels, frame has {}",
            frame.channels
        )));
    }

    let mut rgb = frame.data.clone();
    decoder::swap_red_blue(&mut rgb);

    let img: ImageBuffer<Rgb<u8>, _> = ImageBuffer::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| {
            MailboxError::Encode(format!(
                "{} bytes do not fill {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            ))
        })?;

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    img.write_with_encoder(encoder)
        .map_err(|e| MailboxError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decompress a payload back into `(width, height, bgr)`.
pub fn decode(payload: &[u8]) -> Result<(u32, u32, Vec<u8>), DecodeError> {
    decoder::decode_jpeg(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gradient pattern so the encoder has something to work with.
    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(128);
                data.push((y % 256) as u8);
                data.push((x % 256) as u8);
            }
        }
        Frame::from_bgr(width, height, data).unwrap()
    }

    #[test]
    fn produces_jpeg_magic() {
        let jpeg = encode(&gradient(64, 48), 70).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn lower_quality_is_smaller() {
        let frame = gradient(320, 240);
        let high = encode(&frame, 95).unwrap();
        let low = encode(&frame, 20).unwrap();
        assert!(low.len() < high.len(), "{} >= {}", low.len(), high.len());
    }

    #[test]
    fn out_of_range_quality_is_clamped() {
        assert!(encode(&gradient(16, 16), 0).is_ok());
        assert!(encode(&gradient(16, 16), 255).is_ok());
    }

    #[test]
    fn decode_restores_dimensions_and_colour_order() {
        let frame = Frame::filled(32, 16, [200, 40, 10]);
        let (w, h, bgr) = decode(&encode(&frame, 95).unwrap()).unwrap();
        assert_eq!((w, h), (32, 16));
        assert_eq!(bgr.len(), frame.data.len());
        let px = &bgr[3 * (8 * 32 + 16)..][..3];
        // lossy, but blue must stay dominant
        assert!(px[0] > 150 && px[2] < 60, "pixel {px:?}");
    }

    #[test]
    fn mismatched_buffer_is_an_encode_error() {
        let mut frame = Frame::filled(4, 4, [0, 0, 0]);
        frame.data.truncate(10);
        assert!(matches!(encode(&frame, 70), Err(MailboxError::Encode(_))));
    }
}
