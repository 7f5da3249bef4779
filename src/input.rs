// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 图像输入
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

use crate::{FromUrl, frame::RgbNchwFrame};

pub trait AsNchwFrame {
  fn as_nchw(&self) -> &[u8];

  /// 归一化到 [0, 1] 的浮点张量，布局不变
  fn to_tensor(&self) -> Vec<f32> {
    self
      .as_nchw()
      .iter()
      .map(|&value| f32::from(value) / 255.0)
      .collect()
  }
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageDirectoryInput, ImageFileInput, ImageFileInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper<const W: u32, const H: u32> {
  /// 内存中的帧序列
  Frames(std::vec::IntoIter<RgbNchwFrame<W, H>>),
  #[cfg(feature = "read_image_file")]
  ImageFile(ImageFileInput<W, H>),
  #[cfg(feature = "read_image_file")]
  ImageDirectory(ImageDirectoryInput<W, H>),
}

impl<const W: u32, const H: u32> From<Vec<RgbNchwFrame<W, H>>> for InputWrapper<W, H> {
  fn from(frames: Vec<RgbNchwFrame<W, H>>) -> Self {
    InputWrapper::Frames(frames.into_iter())
  }
}

impl<const W: u32, const H: u32> FromUrl for InputWrapper<W, H> {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::<W, H>::SCHEME {
        return Ok(InputWrapper::ImageFile(ImageFileInput::from_url(url)?));
      }
      if url.scheme() == ImageDirectoryInput::<W, H>::SCHEME {
        return Ok(InputWrapper::ImageDirectory(ImageDirectoryInput::from_url(url)?));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl<const W: u32, const H: u32> Iterator for InputWrapper<W, H> {
  type Item = RgbNchwFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapper::Frames(frames) => frames.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageFile(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageDirectory(input) => input.next(),
    }
  }
}
