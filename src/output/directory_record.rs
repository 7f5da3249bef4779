// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, Local};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbNchwFrame,
  model::{DetectResult, DetectedObject, WithLabel},
  output::Render,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct DetectionRecord<'a> {
  label: String,
  #[serde(flatten)]
  object: &'a DetectedObject,
}

#[derive(Serialize)]
struct FrameRecord<'a> {
  frame: u64,
  timestamp: String,
  width: u32,
  height: u32,
  detections: Vec<DetectionRecord<'a>>,
}

/// 按日期分目录保存每帧的检测记录（JSON），可选同时保存帧图像
pub struct DirectoryRecordOutput<const W: u32, const H: u32, L> {
  directory: PathBuf,
  frame_counter: AtomicU64,
  always: bool,
  save_image: bool,
  label_with_name: bool,
  _label: PhantomData<fn() -> L>,
}

impl<const W: u32, const H: u32, L> FromUrlWithScheme for DirectoryRecordOutput<W, H, L> {
  const SCHEME: &'static str = "folder";
}

impl<const W: u32, const H: u32, L> FromUrl for DirectoryRecordOutput<W, H, L> {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let mut output = Self::new(uri.path());
    for (k, v) in uri.query_pairs() {
      match k.as_ref() {
        "always" => output.always = true,
        "image" => output.save_image = true,
        "record" => output.label_with_name = v != "id",
        _ => {}
      }
    }
    Ok(output)
  }
}

impl<const W: u32, const H: u32, L> DirectoryRecordOutput<W, H, L> {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    DirectoryRecordOutput {
      directory: directory.into(),
      frame_counter: AtomicU64::new(0),
      always: false,
      save_image: false,
      label_with_name: true,
      _label: PhantomData,
    }
  }

  /// 没有检测结果的帧也记录
  pub fn always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  pub fn save_image(mut self, save_image: bool) -> Self {
    self.save_image = save_image;
    self
  }

  /// 已记录的帧数
  pub fn frame_count(&self) -> u64 {
    self.frame_counter.load(Ordering::Relaxed)
  }

  fn frame_stem(&self, now: &DateTime<Local>) -> Result<(u64, PathBuf), std::io::Error> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    let id = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
    let stem = directory.join(format!("{}-{:04X}", now.format("%H-%M-%S"), id));
    Ok((id, stem))
  }
}

fn with_extension(stem: &Path, extension: &str) -> PathBuf {
  let mut path = stem.as_os_str().to_owned();
  path.push(".");
  path.push(extension);
  PathBuf::from(path)
}

impl<const W: u32, const H: u32, L: WithLabel> Render<RgbNchwFrame<W, H>, DetectResult>
  for DirectoryRecordOutput<W, H, L>
{
  type Error = DirectoryRecordOutputError;

  fn render_result(
    &self,
    frame: &RgbNchwFrame<W, H>,
    result: &DetectResult,
  ) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      return Ok(());
    }

    let now = Local::now();
    let (id, stem) = self.frame_stem(&now)?;
    let record = FrameRecord {
      frame: id,
      timestamp: now.to_rfc3339(),
      width: W,
      height: H,
      detections: result
        .iter()
        .map(|object| DetectionRecord {
          label: if self.label_with_name {
            L::from_label_id(object.class_id).to_label_str()
          } else {
            object.class_id.to_string()
          },
          object,
        })
        .collect(),
    };

    let record_path = with_extension(&stem, "json");
    std::fs::write(&record_path, serde_json::to_vec_pretty(&record)?)?;
    debug!("写入记录: {}", record_path.display());

    if self.save_image {
      let image_path = with_extension(&stem, "png");
      frame.to_rgb_image().save(&image_path)?;
      debug!("写入图像: {}", image_path.display());
    }
    Ok(())
  }
}
