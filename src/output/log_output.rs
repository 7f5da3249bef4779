// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/log_output.rs - 日志输出
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

use std::convert::Infallible;
use std::marker::PhantomData;

use tracing::info;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectResult, WithLabel},
  output::Render,
};

/// 把检测结果逐条写入日志
pub struct LogOutput<L> {
  _label: PhantomData<fn() -> L>,
}

impl<L> LogOutput<L> {
  pub fn new() -> Self {
    LogOutput {
      _label: PhantomData,
    }
  }
}

impl<L> Default for LogOutput<L> {
  fn default() -> Self {
    Self::new()
  }
}

impl<L> FromUrlWithScheme for LogOutput<L> {
  const SCHEME: &'static str = "log";
}

impl<L> FromUrl for LogOutput<L> {
  type Error = Infallible;

  fn from_url(_url: &url::Url) -> Result<Self, Self::Error> {
    Ok(Self::new())
  }
}

impl<Frame, L: WithLabel> Render<Frame, DetectResult> for LogOutput<L> {
  type Error = Infallible;

  fn render_result(&self, _frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    info!("检测到 {} 个物体", result.len());
    for (index, item) in result.iter().enumerate() {
      let rect = &item.rect;
      info!(
        "  [{}] {} ({:.3}) x={:.1} y={:.1} w={:.1} h={:.1}",
        index,
        L::from_label_id(item.class_id).to_label_str(),
        item.confidence,
        rect.x,
        rect.y,
        rect.width,
        rect.height
      );
    }
    Ok(())
  }
}
