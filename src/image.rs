//! PNG frame loading and framebuffer blitting.
//!
//! Decoding goes through the `png` crate; every failure surfaces as a
//! [`CinderError::Image`] at the call site. Pixels are packed ARGB in a u32,
//! matching the XRGB8888 scanout format (alpha is ignored by the display).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::{CinderError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ImageData {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

/// Where an image lands on the framebuffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Center,
    /// Shift relative to the centered position.
    Offset(i32, i32),
    /// Absolute top-left corner.
    Location(i32, i32),
}

impl ImageData {
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u32>) -> ImageData {
        debug_assert_eq!(pixels.len(), (width * height) as usize);
        ImageData { width, height, pixels }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }
}

pub fn load(path: &Path) -> Result<ImageData> {
    let file = File::open(path).map_err(|err| CinderError::Image {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    decode(BufReader::new(file)).map_err(|err| CinderError::Image {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

pub fn decode<R: Read>(reader: R) -> std::result::Result<ImageData, png::DecodingError> {
    let mut decoder = png::Decoder::new(reader);
    decoder.set_transformations(png::Transformations::normalize_to_color8());
    let mut reader = decoder.read_info()?;

    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf)?;
    let bytes = &buf[..info.buffer_size()];

    let (width, height) = (info.width, info.height);
    let mut pixels = Vec::with_capacity((width * height) as usize);
    match info.color_type {
        png::ColorType::Rgba => {
            for px in bytes.chunks_exact(4) {
                pixels.push(pack(px[0], px[1], px[2], px[3]));
            }
        }
        png::ColorType::Rgb => {
            for px in bytes.chunks_exact(3) {
                pixels.push(pack(px[0], px[1], px[2], 0xFF));
            }
        }
        png::ColorType::GrayscaleAlpha => {
            for px in bytes.chunks_exact(2) {
                pixels.push(pack(px[0], px[0], px[0], px[1]));
            }
        }
        // Palette and 16-bit depths are expanded by the transformations above.
        _ => {
            for &g in bytes {
                pixels.push(pack(g, g, g, 0xFF));
            }
        }
    }

    Ok(ImageData { width, height, pixels })
}

fn pack(r: u8, g: u8, b: u8, a: u8) -> u32 {
    (a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32
}

/// Top-left corner for an image under the given placement.
pub fn placement_origin(
    placement: Placement,
    fb: (u32, u32),
    image: (u32, u32),
) -> (i32, i32) {
    let (fw, fh) = (fb.0 as i32, fb.1 as i32);
    let (iw, ih) = (image.0 as i32, image.1 as i32);
    match placement {
        Placement::Center => ((fw - iw) / 2, (fh - ih) / 2),
        Placement::Offset(x, y) => ((fw - iw - x) / 2, (fh - ih - y) / 2),
        Placement::Location(x, y) => (x, y),
    }
}

/// Copy the image into the framebuffer at `(x, y)`, replicating each source
/// pixel into a `scale`-square block. Regions falling outside the
/// framebuffer are clipped.
pub fn blit(
    image: &ImageData,
    scale: u32,
    dst: &mut [u32],
    pitch: u32,
    fb_width: u32,
    fb_height: u32,
    x: i32,
    y: i32,
) {
    let stride = pitch as usize / 4;
    let scale = scale.max(1) as i32;

    for row in 0..image.height as i32 {
        for sy in 0..scale {
            let dst_y = y + row * scale + sy;
            if dst_y < 0 || dst_y >= fb_height as i32 {
                continue;
            }
            let line = &mut dst[dst_y as usize * stride..];
            for col in 0..image.width as i32 {
                let px = image.pixels[(row * image.width as i32 + col) as usize];
                for sx in 0..scale {
                    let dst_x = x + col * scale + sx;
                    if dst_x < 0 || dst_x >= fb_width as i32 {
                        continue;
                    }
                    line[dst_x as usize] = px;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> ImageData {
        ImageData::from_pixels(2, 2, vec![0xFF111111, 0xFF222222, 0xFF333333, 0xFF444444])
    }

    #[test]
    fn png_round_trip() {
        let image = checker();
        let mut encoded = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut encoded, image.width(), image.height());
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            let bytes: Vec<u8> = image
                .pixels()
                .iter()
                .flat_map(|&px| {
                    [
                        (px >> 16) as u8,
                        (px >> 8) as u8,
                        px as u8,
                        (px >> 24) as u8,
                    ]
                })
                .collect();
            writer.write_image_data(&bytes).unwrap();
        }

        let decoded = decode(&encoded[..]).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn placement_math() {
        let fb = (640, 480);
        let img = (100, 40);
        assert_eq!(placement_origin(Placement::Center, fb, img), (270, 220));
        assert_eq!(placement_origin(Placement::Offset(0, 0), fb, img), (270, 220));
        assert_eq!(placement_origin(Placement::Offset(20, -10), fb, img), (260, 225));
        assert_eq!(placement_origin(Placement::Location(100, 200), fb, img), (100, 200));
    }

    #[test]
    fn blit_copies_rows() {
        let image = checker();
        let mut dst = vec![0u32; 4 * 4];
        blit(&image, 1, &mut dst, 16, 4, 4, 1, 1);
        assert_eq!(dst[1 * 4 + 1], 0xFF111111);
        assert_eq!(dst[1 * 4 + 2], 0xFF222222);
        assert_eq!(dst[2 * 4 + 1], 0xFF333333);
        assert_eq!(dst[2 * 4 + 2], 0xFF444444);
        assert_eq!(dst[0], 0);
    }

    #[test]
    fn blit_clips_at_edges() {
        let image = checker();
        let mut dst = vec![0u32; 4 * 4];
        blit(&image, 1, &mut dst, 16, 4, 4, -1, 3);
        // Only the bottom-right source pixel's left neighbor lands in bounds.
        assert_eq!(dst[3 * 4], 0xFF222222);
        assert_eq!(dst.iter().filter(|&&px| px != 0).count(), 1);
    }

    #[test]
    fn blit_scales_blocks() {
        let image = ImageData::from_pixels(1, 1, vec![0xFFABCDEF]);
        let mut dst = vec![0u32; 4 * 4];
        blit(&image, 2, &mut dst, 16, 4, 4, 1, 1);
        for y in 0..4 {
            for x in 0..4 {
                let expect = if (1..3).contains(&x) && (1..3).contains(&y) {
                    0xFFABCDEF
                } else {
                    0
                };
                assert_eq!(dst[y * 4 + x], expect);
            }
        }
    }
}
