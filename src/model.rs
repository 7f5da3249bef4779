// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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

use serde::Serialize;

use crate::engine::executor::RetrieveMode;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 支持提交/取回两段式推理的模型
pub trait AsyncModel: Model {
  fn submit(&self, input: &Self::Input) -> Result<(), Self::Error>;

  /// 结果未就绪时返回 `Ok(None)`
  fn retrieve(&self, mode: RetrieveMode) -> Result<Option<Self::Output>, Self::Error>;
}

/// 左上角坐标与宽高
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectedObject {
  pub rect: BoundingBox,
  pub class_id: i32,
  pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectedObject]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &DetectedObject> {
    self.items.iter()
  }
}

impl From<Vec<DetectedObject>> for DetectResult {
  fn from(items: Vec<DetectedObject>) -> Self {
    DetectResult {
      items: items.into_boxed_slice(),
    }
  }
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> String;
  fn to_label_id(&self) -> i32;
  fn from_label_id(id: i32) -> Self;
}

pub mod decode;
mod label;
pub use self::label::{COCO_CLASSES, CocoLabel};

#[cfg(feature = "model_yolo_nms")]
mod yolo_nms;
#[cfg(feature = "model_yolo_nms")]
pub use self::yolo_nms::{DetectorError, RuntimeFactory, YoloNms, YoloNmsBuilder};
