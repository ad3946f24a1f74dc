//! OBM (Omega Bit Map), the raw wallpaper format understood by the calculator

use std::io::{self, Read, Write};

use log::debug;

use crate::Error;

/// Magic value at the start of every OBM image
pub const OBM_MAGIC: u32 = 466_512_775;

/// The only wallpaper size the calculator accepts
pub const WALLPAPER_WIDTH: u32 = 320;
pub const WALLPAPER_HEIGHT: u32 = 222;

/// A decoded wallpaper with non-premultiplied RGBA8888 pixels, row-major.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Wallpaper {
    /// Name of the file the wallpaper was selected from
    pub name: String,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Wallpaper {
    /// Creates a wallpaper from raw RGBA pixels, rejecting anything that isn't 320x222.
    ///
    /// `pixels` must hold exactly four bytes per pixel.
    pub fn from_rgba<S: Into<String>>(
        name: S,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Wallpaper, Error> {
        if width != WALLPAPER_WIDTH || height != WALLPAPER_HEIGHT {
            return Err(Error::InvalidWallpaperSize(width, height));
        }

        let expected = width as usize * height as usize * 4;

        if pixels.len() != expected {
            return Err(Error::InvalidPixelBuffer {
                expected,
                actual: pixels.len(),
            });
        }

        Ok(Wallpaper::from_rgba_unchecked(name, width, height, pixels))
    }

    /// Decodes a PNG image from `reader` and validates its size.
    pub fn from_png<S: Into<String>, R: Read>(name: S, reader: R) -> Result<Wallpaper, Error> {
        let mut decoder = png::Decoder::new(reader);
        decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);

        let mut reader = decoder.read_info()?;
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf)?;
        let data = &buf[..info.buffer_size()];

        debug!(
            "Decoded {}x{} PNG with color type {:?}",
            info.width, info.height, info.color_type
        );

        let pixels = match info.color_type {
            png::ColorType::Rgba => data.to_vec(),
            png::ColorType::Rgb => data
                .chunks_exact(3)
                .flat_map(|px| [px[0], px[1], px[2], 0xff])
                .collect(),
            png::ColorType::GrayscaleAlpha => data
                .chunks_exact(2)
                .flat_map(|px| [px[0], px[0], px[0], px[1]])
                .collect(),
            png::ColorType::Grayscale => data.iter().flat_map(|&v| [v, v, v, 0xff]).collect(),
            // EXPAND turns palettes into RGB(A)
            png::ColorType::Indexed => unreachable!("indexed PNG after palette expansion"),
        };

        Wallpaper::from_rgba(name, info.width, info.height, pixels)
    }

    pub(crate) fn from_rgba_unchecked<S: Into<String>>(
        name: S,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Wallpaper {
        Wallpaper {
            name: name.into(),
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// A wallpaper converted to RGB565
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ObmImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl ObmImage {
    /// Converts every pixel of `wallpaper` by compositing it over white.
    pub fn from_wallpaper(wallpaper: &Wallpaper) -> ObmImage {
        let pixels = wallpaper
            .pixels
            .chunks_exact(4)
            .map(|px| rgba_to_rgb565(px[0], px[1], px[2], px[3]))
            .collect();

        ObmImage {
            width: wallpaper.width,
            height: wallpaper.height,
            pixels,
        }
    }

    /// Writes the header followed by the pixel data to `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Returns the little-endian header followed by the pixel data
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.pixels.len() * 2);

        buf.extend_from_slice(&OBM_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());

        for pixel in &self.pixels {
            buf.extend_from_slice(&pixel.to_le_bytes());
        }

        buf
    }
}

/// Encodes `wallpaper` into the bytes of a `.obm` file
pub fn encode_obm(wallpaper: &Wallpaper) -> Vec<u8> {
    ObmImage::from_wallpaper(wallpaper).to_bytes()
}

/// Composites a pixel over opaque white and packs it as RGB565.
///
/// Each channel is rounded to 8 bits first and only then truncated to 5 or 6 bits.
fn rgba_to_rgb565(r: u8, g: u8, b: u8, a: u8) -> u16 {
    let alpha = f64::from(a) / 255.0;
    let blend = |c: u8| -> u16 {
        let c = f64::from(c) / 255.0;
        let composited = c * alpha + (1.0 - alpha);

        (composited * 255.0).round() as u16
    };

    let (r, g, b) = (blend(r), blend(g), blend(b));

    (r >> 3) << 11 | (g >> 2) << 5 | (b >> 3)
}

#[cfg(test)]
mod tests {
    use assert_hex::*;
    use hex_literal::hex;

    use super::*;

    fn single_pixel(rgba: [u8; 4]) -> Wallpaper {
        Wallpaper::from_rgba_unchecked("pixel.png", 1, 1, rgba.to_vec())
    }

    #[test]
    fn it_should_encode_opaque_white_as_ffff() {
        let obm = ObmImage::from_wallpaper(&single_pixel([0xff, 0xff, 0xff, 0xff]));

        assert_eq_hex!(obm.pixels, vec![0xffffu16]);
    }

    #[test]
    fn it_should_composite_transparent_pixels_over_white() {
        for rgb in &[[0u8, 0, 0], [0x12, 0x34, 0x56], [0xff, 0, 0x80]] {
            let obm = ObmImage::from_wallpaper(&single_pixel([rgb[0], rgb[1], rgb[2], 0]));

            assert_eq_hex!(obm.pixels, vec![0xffffu16]);
        }
    }

    #[test]
    fn it_should_pack_opaque_colors() {
        assert_eq_hex!(rgba_to_rgb565(0, 0, 0, 0xff), 0x0000);
        assert_eq_hex!(rgba_to_rgb565(0xff, 0, 0, 0xff), 0xf800);
        assert_eq_hex!(rgba_to_rgb565(0, 0xff, 0, 0xff), 0x07e0);
        assert_eq_hex!(rgba_to_rgb565(0, 0, 0xff, 0xff), 0x001f);
    }

    #[test]
    fn it_should_round_before_truncating() {
        // Black at alpha 0x80 blends to 127 on every channel
        assert_eq_hex!(rgba_to_rgb565(0, 0, 0, 0x80), 0x7bef);
        assert_eq_hex!(rgba_to_rgb565(0x80, 0x80, 0x80, 0xff), 0x8410);
    }

    #[test]
    fn it_should_write_header_and_pixels_little_endian() {
        let wallpaper = Wallpaper::from_rgba_unchecked(
            "two.png",
            2,
            1,
            vec![0xff, 0x00, 0x00, 0xff, 0x00, 0x00, 0xff, 0xff],
        );
        let bytes = encode_obm(&wallpaper);

        assert_eq_hex!(
            &bytes[..],
            &hex!("87 6B CE 1B 02 00 00 00 01 00 00 00 00 F8 1F 00")[..]
        );
    }

    #[test]
    fn it_should_be_deterministic() {
        let pixels: Vec<u8> = (0..WALLPAPER_WIDTH * WALLPAPER_HEIGHT * 4)
            .map(|i| (i % 251) as u8)
            .collect();
        let wallpaper =
            Wallpaper::from_rgba("noise.png", WALLPAPER_WIDTH, WALLPAPER_HEIGHT, pixels).unwrap();

        let first = encode_obm(&wallpaper);
        let second = encode_obm(&wallpaper);

        assert_eq!(first.len(), 12 + 320 * 222 * 2);
        assert_eq!(first, second);
    }

    #[test]
    fn it_should_reject_wrong_wallpaper_size() {
        let result = Wallpaper::from_rgba("small.png", 32, 32, vec![0; 32 * 32 * 4]);

        assert!(matches!(result, Err(Error::InvalidWallpaperSize(32, 32))));
    }

    #[test]
    fn it_should_reject_pixel_buffers_of_the_wrong_length() {
        let empty = Wallpaper::from_rgba("empty.png", WALLPAPER_WIDTH, WALLPAPER_HEIGHT, vec![]);

        assert!(matches!(
            empty,
            Err(Error::InvalidPixelBuffer {
                expected: 284_160,
                actual: 0
            })
        ));

        let ragged = Wallpaper::from_rgba(
            "ragged.png",
            WALLPAPER_WIDTH,
            WALLPAPER_HEIGHT,
            vec![0; 320 * 222 * 4 + 3],
        );

        assert!(matches!(ragged, Err(Error::InvalidPixelBuffer { actual: 284_163, .. })));
    }

    #[test]
    fn it_should_write_the_same_bytes_to_a_writer() {
        let obm = ObmImage::from_wallpaper(&single_pixel([0xff, 0x00, 0x00, 0xff]));
        let mut written = Vec::new();

        obm.write_to(&mut written).unwrap();

        assert_eq_hex!(&written[..], &hex!("87 6B CE 1B 01 00 00 00 01 00 00 00 00 F8")[..]);
    }

    #[test]
    fn it_should_decode_png_wallpapers() {
        let mut encoded = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut encoded, WALLPAPER_WIDTH, WALLPAPER_HEIGHT);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);

            let mut writer = encoder.write_header().unwrap();
            let data = vec![0u8; (WALLPAPER_WIDTH * WALLPAPER_HEIGHT * 3) as usize];
            writer.write_image_data(&data).unwrap();
        }

        let wallpaper = Wallpaper::from_png("black.png", &encoded[..]).unwrap();
        let obm = ObmImage::from_wallpaper(&wallpaper);

        assert_eq!(wallpaper.width(), WALLPAPER_WIDTH);
        assert!(obm.pixels.iter().all(|&px| px == 0));
    }
}
