// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/introspect.rs - 模型绑定信息提取
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

use std::fmt;

use tracing::{debug, error, info};

use crate::engine::{EngineError, runtime::CompiledModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingDirection {
  Input,
  Output,
}

impl fmt::Display for BindingDirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BindingDirection::Input => write!(f, "输入"),
      BindingDirection::Output => write!(f, "输出"),
    }
  }
}

/// 经过校验的绑定信息，提取完成后不再改变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelBinding {
  /// 模型原生绑定序号
  pub index: usize,
  pub name: String,
  pub direction: BindingDirection,
  pub shape: Vec<u64>,
  pub element_count: u64,
}

impl ModelBinding {
  pub fn is_input(&self) -> bool {
    self.direction == BindingDirection::Input
  }

  /// 元素数乘以元素字节宽度；超出地址空间时饱和，随后的分配必然失败
  pub fn byte_size(&self, element_bytes: usize) -> usize {
    usize::try_from(self.element_count)
      .unwrap_or(usize::MAX)
      .saturating_mul(element_bytes)
  }

  /// 行主序步长，以元素为单位
  pub fn strides(&self) -> Vec<u64> {
    let mut strides = vec![1u64; self.shape.len()];
    for axis in (0..self.shape.len().saturating_sub(1)).rev() {
      strides[axis] = strides[axis + 1] * self.shape[axis + 1];
    }
    strides
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelLayout {
  pub inputs: Vec<ModelBinding>,
  pub outputs: Vec<ModelBinding>,
}

impl ModelLayout {
  pub fn num_bindings(&self) -> usize {
    self.inputs.len() + self.outputs.len()
  }
}

fn element_count(name: &str, dims: &[i64]) -> Result<(Vec<u64>, u64), EngineError> {
  if dims.is_empty() {
    return Err(EngineError::EmptyBindingSet {
      binding: name.to_string(),
    });
  }

  let mut shape = Vec::with_capacity(dims.len());
  let mut elements = 1u64;
  for (axis, &extent) in dims.iter().enumerate() {
    let invalid = || EngineError::InvalidModelDimension {
      binding: name.to_string(),
      axis,
      extent,
    };
    if extent <= 0 {
      return Err(invalid());
    }
    let extent = extent as u64;
    elements = elements.checked_mul(extent).ok_or_else(invalid)?;
    shape.push(extent);
  }
  Ok((shape, elements))
}

/// 按原生顺序遍历模型绑定，输入必须全部位于输出之前
pub fn introspect(model: &dyn CompiledModel) -> Result<ModelLayout, EngineError> {
  let num_bindings = model.num_bindings();
  debug!("模型绑定数量: {}", num_bindings);

  let mut layout = ModelLayout::default();
  for index in 0..num_bindings {
    let raw = model
      .binding(index)
      .ok_or(EngineError::MissingBinding { index })?;

    let (shape, element_count) = element_count(&raw.name, &raw.dims).inspect_err(|e| {
      error!("绑定 [{}] {} 无效: {}", index, raw.name, e);
    })?;

    let direction = if raw.is_input {
      BindingDirection::Input
    } else {
      BindingDirection::Output
    };

    if direction == BindingDirection::Input && !layout.outputs.is_empty() {
      error!("输入绑定 [{}] {} 位于输出绑定之后", index, raw.name);
      return Err(EngineError::InterleavedBindings { binding: raw.name });
    }

    debug!(
      "{} [{}]: {} 维度 {:?} 元素数 {}",
      direction, index, raw.name, shape, element_count
    );

    let binding = ModelBinding {
      index,
      name: raw.name,
      direction,
      shape,
      element_count,
    };
    match direction {
      BindingDirection::Input => layout.inputs.push(binding),
      BindingDirection::Output => layout.outputs.push(binding),
    }
  }

  info!(
    "模型参数: {} 个输入, {} 个输出",
    layout.inputs.len(),
    layout.outputs.len()
  );
  Ok(layout)
}
