use crate::{Dims, Error, PIXEL_MAX, PIXEL_MIN};
use ndarray::{Array4, ArrayView3};
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the session
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Decodes an image, drops any alpha channel and resizes it to `size`
pub(crate) fn load_image(src: ImageSource<'_>, size: Dims) -> Result<image::RgbImage, Error> {
    use image::GenericImageView;

    let img = load_dynamic_image(src)?;

    let img = if img.width() != size.width || img.height() != size.height {
        image::imageops::resize(
            &img.to_rgb(),
            size.width,
            size.height,
            image::imageops::CatmullRom,
        )
    } else {
        img.to_rgb()
    };

    Ok(img)
}

/// Loads an image as a `(1, 3, height, width)` tensor of pixel values in
/// `[0, 255]`, resized to `size`
pub fn load_pixels(src: ImageSource<'_>, size: Dims) -> Result<Array4<f32>, Error> {
    Ok(image_to_pixels(&load_image(src, size)?))
}

pub(crate) fn image_to_pixels(img: &image::RgbImage) -> Array4<f32> {
    let (width, height) = img.dimensions();

    Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| f32::from(img.get_pixel(x as u32, y as u32)[c]),
    )
}

/// Converts one `(3, height, width)` item into an 8-bit image, rounding and
/// saturating out of range values
pub(crate) fn pixels_to_image(item: ArrayView3<'_, f32>) -> image::RgbImage {
    let (_, height, width) = item.dim();

    image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let mut rgb = [0u8; 3];
        for (c, channel) in rgb.iter_mut().enumerate() {
            *channel = item[[c, y, x]].round().max(PIXEL_MIN).min(PIXEL_MAX) as u8;
        }
        image::Rgb(rgb)
    })
}

/// Converts every item of a `(batch, 3, height, width)` tensor
pub(crate) fn pixels_to_images(pixels: &Array4<f32>) -> Vec<image::RgbImage> {
    pixels.outer_iter().map(pixels_to_image).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn checkerboard(size: u32) -> image::DynamicImage {
        image::DynamicImage::ImageRgba8(image::RgbaImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgba([255, 0, 10, 128])
            } else {
                image::Rgba([0, 200, 30, 255])
            }
        }))
    }

    #[test]
    fn loads_rgb_pixels_in_nchw_order() {
        let pixels = load_pixels(checkerboard(4).into(), Dims::square(4)).unwrap();

        assert_eq!(pixels.dim(), (1, 3, 4, 4));
        // alpha is dropped, channels are kept at their 8-bit scale
        assert_eq!(pixels[[0, 0, 0, 0]], 255.0);
        assert_eq!(pixels[[0, 1, 0, 0]], 0.0);
        assert_eq!(pixels[[0, 1, 0, 1]], 200.0);
        assert_eq!(pixels[[0, 2, 1, 0]], 30.0);
    }

    #[test]
    fn resizes_to_requested_dims() {
        let pixels = load_pixels(checkerboard(8).into(), Dims::new(6, 3)).unwrap();
        assert_eq!(pixels.dim(), (1, 3, 3, 6));
    }

    #[test]
    fn pixels_round_trip_through_images() {
        let img = checkerboard(5).to_rgb();

        let pixels = image_to_pixels(&img);
        let images = pixels_to_images(&pixels);

        assert_eq!(images.len(), 1);
        assert_eq!(images[0], img);
    }

    #[test]
    fn saturates_out_of_range_pixels() {
        let mut pixels = Array4::zeros((2, 3, 1, 1));
        pixels[[0, 0, 0, 0]] = 300.0;
        pixels[[1, 1, 0, 0]] = -4.0;
        pixels[[1, 2, 0, 0]] = 12.6;

        let images = pixels_to_images(&pixels);

        assert_eq!(images.len(), 2);
        assert_eq!(images[0].get_pixel(0, 0), &image::Rgb([255, 0, 0]));
        assert_eq!(images[1].get_pixel(0, 0), &image::Rgb([0, 0, 13]));
    }

    #[test]
    fn converts_a_single_item() {
        let pixels = Array4::from_shape_fn((3, 3, 2, 2), |(b, c, y, x)| {
            (b * 60 + c * 20 + y * 2 + x) as f32
        });

        let images = pixels_to_images(&pixels);
        for (b, expected) in images.iter().enumerate() {
            assert_eq!(&pixels_to_image(pixels.index_axis(ndarray::Axis(0), b)), expected);
        }
    }
}
