//! Conversion from device pixel formats to the BGR rasters carried by [`Frame`].

use thiserror::Error;
use zune_jpeg::JpegDecoder;

use super::frame::{raster_len, Frame, FrameSizeError, PixelFormat};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("jpeg decode failed: {0}")]
    Jpeg(String),

    #[error("jpeg stream carries no dimensions")]
    MissingDimensions,

    #[error(transparent)]
    Size(#[from] FrameSizeError),
}

/// Decode one device buffer into a BGR frame.
///
/// `width` and `height` are the negotiated stream dimensions; MJPEG buffers
/// carry their own and ignore them.
pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Frame, DecodeError> {
    match format {
        PixelFormat::Mjpeg => {
            let (width, height, bgr) = decode_jpeg(data)?;
            Ok(Frame::from_bgr(width, height, bgr)?)
        }
        PixelFormat::Bgr24 => Ok(Frame::from_bgr(width, height, data.to_vec())?),
        PixelFormat::Rgb24 => {
            let mut bgr = data.to_vec();
            swap_red_blue(&mut bgr);
            Ok(Frame::from_bgr(width, height, bgr)?)
        }
        PixelFormat::Yuyv4 => {
            let expected = width as usize * height as usize * 2;
            if data.len() < expected {
                return Err(FrameSizeError {
                    width,
                    height,
                    expected,
                    actual: data.len(),
                }
                .into());
            }
            Ok(Frame::from_bgr(width, height, yuyv_to_bgr(&data[..expected]))?)
        }
    }
}

/// Decode a baseline or progressive JPEG into `(width, height, bgr)`.
pub fn decode_jpeg(data: &[u8]) -> Result<(u32, u32, Vec<u8>), DecodeError> {
    let mut decoder = JpegDecoder::new(data);
    let mut pixels = decoder
        .decode()
        .map_err(|e| DecodeError::Jpeg(format!("{e:?}")))?;
    let (width, height) = decoder.dimensions().ok_or(DecodeError::MissingDimensions)?;
    let (width, height) = (width as u32, height as u32);

    // zune-jpeg emits RGB by default
    let expected = raster_len(width, height);
    if pixels.len() != expected {
        return Err(FrameSizeError {
            width,
            height,
            expected,
            actual: pixels.len(),
        }
        .into());
    }
    swap_red_blue(&mut pixels);

    Ok((width, height, pixels))
}

/// Swap the first and third byte of every 3-byte pixel (RGB <-> BGR).
pub fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

/// Packed YUYV 4:2:2 to BGR, BT.601 limited range.
fn yuyv_to_bgr(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        out.extend_from_slice(&yuv_to_bgr(y0, u, v));
        out.extend_from_slice(&yuv_to_bgr(y1, u, v));
    }
    out
}

fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [clamp(b), clamp(g), clamp(r)]
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_is_reordered_to_bgr() {
        let frame = decode_frame(&[10, 20, 30, 40, 50, 60], PixelFormat::Rgb24, 2, 1).unwrap();
        assert_eq!(frame.data, vec![30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn bgr_length_is_checked() {
        let err = decode_frame(&[0; 5], PixelFormat::Bgr24, 2, 1).unwrap_err();
        assert!(matches!(err, DecodeError::Size(_)));
    }

    #[test]
    fn yuyv_grey_stays_grey() {
        // Y=126 U=V=128 is mid grey with no chroma
        let frame = decode_frame(&[126, 128, 126, 128], PixelFormat::Yuyv4, 2, 1).unwrap();
        assert_eq!(frame.width, 2);
        let px = &frame.data[..3];
        assert!(px[0] == px[1] && px[1] == px[2], "pixel {px:?} is not grey");
    }

    #[test]
    fn yuyv_extremes_clamp() {
        assert_eq!(yuv_to_bgr(255, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_bgr(0, 128, 128), [0, 0, 0]);
    }

    #[test]
    fn garbage_jpeg_is_an_error() {
        assert!(decode_jpeg(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
