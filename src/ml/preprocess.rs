//! 画像の前処理
//!
//! 学習時と推論時で完全に同じ経路を通すため、デコードから正規化までを
//! この1関数に集約しています。
//!
//! # 手順
//! 1. デコードしてRGB 3チャンネルにする（アルファは破棄）
//! 2. アニメーション画像は先頭フレームのみ使用（下記の固定ルール）
//! 3. 224x224へ最近傍補間でリサイズ
//! 4. u8 → f32 に変換し 255.0 で割る
//! 5. 形状が [224, 224, 3] であることを検証
//!
//! # 複数フレームの扱い
//! - GIF: アニメーションデコーダで先頭フレームを取り出す
//! - PNG(APNG) / WebP: 通常のデコードがデフォルト画像（先頭フレーム）を返す
//! - その他: 単一フレーム

use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, ImageFormat, RgbImage};

use crate::error::PreprocessError;
use crate::types::{PixelTensor, CHANNELS, IMAGE_SIZE, PIXEL_SHAPE};

/// 画像バイト列を正規化済みのPixelTensorに変換
pub fn preprocess(bytes: &[u8]) -> Result<PixelTensor, PreprocessError> {
    let raster = decode_first_frame(bytes)?;

    let resized = image::imageops::resize(
        &raster,
        IMAGE_SIZE as u32,
        IMAGE_SIZE as u32,
        FilterType::Nearest,
    );

    let (width, height) = resized.dimensions();
    let actual = [height as usize, width as usize, CHANNELS];
    if actual != PIXEL_SHAPE {
        return Err(PreprocessError::shape(&PIXEL_SHAPE, &actual));
    }

    let data: Vec<f32> = resized
        .as_raw()
        .iter()
        .map(|&value| f32::from(value) / 255.0)
        .collect();

    PixelTensor::from_vec(data)
}

/// デコードしてRGBラスタを得る（アニメーションは先頭フレーム）
fn decode_first_frame(bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
    let format = image::guess_format(bytes)
        .map_err(|e| PreprocessError::decode(format!("unknown image format: {}", e)))?;

    let image = match format {
        ImageFormat::Gif => first_gif_frame(bytes)?,
        _ => image::load_from_memory_with_format(bytes, format)
            .map_err(|e| PreprocessError::decode(e.to_string()))?,
    };

    Ok(image.to_rgb8())
}

fn first_gif_frame(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    let decoder =
        GifDecoder::new(Cursor::new(bytes)).map_err(|e| PreprocessError::decode(e.to_string()))?;

    let frame = decoder
        .into_frames()
        .next()
        .ok_or_else(|| PreprocessError::decode("GIF has no frames"))?
        .map_err(|e| PreprocessError::decode(e.to_string()))?;

    Ok(DynamicImage::ImageRgba8(frame.into_buffer()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Frame, Rgb, Rgba, RgbaImage};

    fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, format).unwrap();
        buffer.into_inner()
    }

    fn quadrant_image() -> RgbImage {
        // 左上=赤, 右上=緑, 左下=青, 右下=白
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        img.put_pixel(0, 1, Rgb([0, 0, 255]));
        img.put_pixel(1, 1, Rgb([255, 255, 255]));
        img
    }

    #[test]
    fn output_has_fixed_shape_and_unit_range() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(37, 91, |x, y| {
            Rgb([(x * 7) as u8, (y * 3) as u8, 200])
        }));
        let tensor = preprocess(&encode(&img, ImageFormat::Png)).unwrap();

        assert_eq!(tensor.shape(), [224, 224, 3]);
        assert_eq!(tensor.as_slice().len(), 224 * 224 * 3);
        assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn same_bytes_give_identical_tensors() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| {
            Rgb([(x ^ y) as u8, (x + y) as u8, (x * y) as u8])
        }));
        let bytes = encode(&img, ImageFormat::Jpeg);
        let before = bytes.clone();

        let first = preprocess(&bytes).unwrap();
        let second = preprocess(&bytes).unwrap();

        assert_eq!(first, second);
        assert_eq!(bytes, before);
    }

    #[test]
    fn nearest_neighbour_keeps_exact_colours() {
        let bytes = encode(&DynamicImage::ImageRgb8(quadrant_image()), ImageFormat::Png);
        let tensor = preprocess(&bytes).unwrap();

        // 補間で中間色が生まれないこと
        assert!(tensor.as_slice().iter().all(|&v| v == 0.0 || v == 1.0));
        assert_eq!(tensor.get(0, 0, 0), Some(1.0));
        assert_eq!(tensor.get(0, 0, 1), Some(0.0));
        assert_eq!(tensor.get(0, 223, 1), Some(1.0));
        assert_eq!(tensor.get(223, 0, 2), Some(1.0));
        assert_eq!(tensor.get(223, 223, 0), Some(1.0));
        assert_eq!(tensor.get(223, 223, 1), Some(1.0));
    }

    #[test]
    fn alpha_channel_is_dropped() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 0])));
        let tensor = preprocess(&encode(&img, ImageFormat::Png)).unwrap();
        assert_eq!(tensor.get(4, 4, 0), Some(1.0));
        assert_eq!(tensor.get(4, 4, 2), Some(0.0));
    }

    #[test]
    fn animated_gif_uses_first_frame_only() {
        let red = RgbaImage::from_pixel(16, 16, Rgba([250, 10, 10, 255]));
        let blue = RgbaImage::from_pixel(16, 16, Rgba([10, 10, 250, 255]));

        let mut bytes = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut bytes);
            encoder
                .encode_frames(vec![Frame::new(red), Frame::new(blue)])
                .unwrap();
        }

        let tensor = preprocess(&bytes).unwrap();
        assert_eq!(tensor.shape(), [224, 224, 3]);
        let r = tensor.get(100, 100, 0).unwrap();
        let b = tensor.get(100, 100, 2).unwrap();
        assert!(r > 0.8 && b < 0.2, "expected red first frame, got r={} b={}", r, b);
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let err = preprocess(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PreprocessError::Decode(_)));
    }

    #[test]
    fn truncated_png_is_a_decode_error() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(32, 32));
        let bytes = encode(&img, ImageFormat::Png);
        let err = preprocess(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, PreprocessError::Decode(_)));
    }
}
