// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - NCHW 帧定义
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use thiserror::Error;

use crate::input::AsNchwFrame;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 8 位 RGB 平面帧，通道优先排列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbNchwFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> RgbNchwFrame<W, H> {
  pub const LEN: usize = RGB_CHANNELS * W as usize * H as usize;

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// (c, y, x) 处的像素值
  pub fn pixel(&self, c: usize, y: usize, x: usize) -> Option<u8> {
    if c >= RGB_CHANNELS || y >= self.height() || x >= self.width() {
      return None;
    }
    self.data.get((c * self.height() + y) * self.width() + x).copied()
  }
}

impl<const W: u32, const H: u32> TryFrom<Vec<u8>> for RgbNchwFrame<W, H> {
  type Error = FrameError;

  fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
    if data.len() != Self::LEN {
      return Err(FrameError::LengthMismatch {
        expected: Self::LEN,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
    })
  }
}

impl<const W: u32, const H: u32> Default for RgbNchwFrame<W, H> {
  fn default() -> Self {
    Self {
      data: vec![0u8; Self::LEN].into_boxed_slice(),
    }
  }
}

impl<const W: u32, const H: u32> AsMut<[u8]> for RgbNchwFrame<W, H> {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl<const W: u32, const H: u32> AsNchwFrame for RgbNchwFrame<W, H> {
  fn as_nchw(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(feature = "image")]
mod rgb_image {
  use image::{RgbImage, imageops::FilterType};

  use super::{RGB_CHANNELS, RgbNchwFrame};

  impl<const W: u32, const H: u32> RgbNchwFrame<W, H> {
    /// 缩放到帧尺寸后按通道拆分
    pub fn from_rgb_image(image: &RgbImage) -> Self {
      let resized;
      let image = if image.dimensions() == (W, H) {
        image
      } else {
        resized = image::imageops::resize(image, W, H, FilterType::Triangle);
        &resized
      };

      let mut frame = Self::default();
      let plane = W as usize * H as usize;
      let slice = frame.as_mut();
      for (index, pixel) in image.pixels().enumerate() {
        for c in 0..RGB_CHANNELS {
          slice[c * plane + index] = pixel[c];
        }
      }
      frame
    }

    pub fn to_rgb_image(&self) -> RgbImage {
      let plane = W as usize * H as usize;
      RgbImage::from_fn(W, H, |x, y| {
        let index = y as usize * W as usize + x as usize;
        image::Rgb([
          self.data[index],
          self.data[plane + index],
          self.data[2 * plane + index],
        ])
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_wrong_length() {
    let err = RgbNchwFrame::<2, 2>::try_from(vec![0u8; 11]).unwrap_err();
    assert_eq!(
      err,
      FrameError::LengthMismatch {
        expected: 12,
        actual: 11
      }
    );
  }

  #[test]
  fn tensor_is_normalised_and_planar() {
    let data: Vec<u8> = vec![0, 255, 51, 102, 0, 0, 0, 0, 255, 255, 255, 255];
    let frame = RgbNchwFrame::<2, 2>::try_from(data).unwrap();
    assert_eq!(frame.pixel(0, 0, 1), Some(255));
    assert_eq!(frame.pixel(2, 1, 1), Some(255));
    assert_eq!(frame.pixel(3, 0, 0), None);

    let tensor = frame.to_tensor();
    assert_eq!(tensor.len(), 12);
    assert_eq!(tensor[0], 0.0);
    assert_eq!(tensor[1], 1.0);
    assert!((tensor[2] - 0.2).abs() < 1e-6);
  }

  #[cfg(feature = "image")]
  #[test]
  fn rgb_image_conversion_keeps_pixels() {
    let image = image::RgbImage::from_fn(2, 2, |x, y| image::Rgb([x as u8, y as u8, 7]));
    let frame = RgbNchwFrame::<2, 2>::from_rgb_image(&image);
    assert_eq!(frame.pixel(0, 1, 1), Some(1));
    assert_eq!(frame.pixel(2, 0, 0), Some(7));
    assert_eq!(frame.to_rgb_image(), image);
  }
}
