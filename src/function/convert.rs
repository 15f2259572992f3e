pub use super::*;
pub use burn::tensor::{backend::Backend, Tensor, TensorData};

use image::{GrayImage, Luma, Rgb, RgbImage};

/// Decoding an 8-bit RGB image into [`Image`].
pub fn get_image_from_rgb_image(rgb_image: &RgbImage) -> Image {
    Image {
        height: rgb_image.height(),
        pixels: rgb_image
            .pixels()
            .map(|Rgb(p)| p.map(|v| v as f32 / 255.0))
            .collect(),
        width: rgb_image.width(),
    }
}

/// Encoding [`Image`] into an 8-bit RGB image, clamping to `[0, 1]`.
pub fn get_rgb_image_from_image(image: &Image) -> RgbImage {
    RgbImage::from_fn(image.width, image.height, |x, y| {
        Rgb(image
            .get(x, y)
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8))
    })
}

/// Encoding [`ScalarMap`] into an 8-bit gray image normalized by its maximum.
pub fn get_gray_image_from_map(map: &ScalarMap) -> GrayImage {
    let max = map.max().max(f32::EPSILON);
    GrayImage::from_fn(map.width, map.height, |x, y| {
        Luma([((map.get(x, y) / max).clamp(0.0, 1.0) * 255.0).round() as u8])
    })
}

/// `[1, 3, I_y, I_x]`
pub fn get_tensor_from_image<B: Backend>(
    image: &Image,
    device: &B::Device,
) -> Tensor<B, 4> {
    let pixel_count = image.pixel_count();
    let mut values = vec![0.0_f32; pixel_count * 3];
    image.pixels.iter().enumerate().for_each(|(index, pixel)| {
        pixel.iter().enumerate().for_each(|(channel, value)| {
            values[channel * pixel_count + index] = *value;
        });
    });

    Tensor::from_data(
        TensorData::new(
            values,
            [1, 3, image.height as usize, image.width as usize],
        ),
        device,
    )
}
