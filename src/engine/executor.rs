// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/executor.rs - 推理执行
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
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::engine::{
  EngineError,
  buffer::DeviceBufferPool,
  introspect::{BindingDirection, ModelLayout},
  runtime::{Completion, DeviceError, ExecutionContext},
};

/// 设备错误发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
  CopyToDevice { index: usize },
  Execute,
  Enqueue,
  Completion,
  CopyToHost { index: usize },
}

impl fmt::Display for ExecutionStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ExecutionStage::CopyToDevice { index } => write!(f, "拷贝输入 {} 到设备", index),
      ExecutionStage::Execute => write!(f, "执行"),
      ExecutionStage::Enqueue => write!(f, "提交到执行流"),
      ExecutionStage::Completion => write!(f, "异步执行"),
      ExecutionStage::CopyToHost { index } => write!(f, "拷贝输出 {} 到主机", index),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
  Idle,
  Submitted,
  Complete,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveMode {
  /// 阻塞直到设备工作完成
  Blocking,
  /// 未完成时立即返回 `Retrieval::Pending`
  Poll,
  /// 最多等待给定时长，超时后提交仍然有效
  Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieval {
  /// 输出已拷回主机，携带写入的字节数
  Complete { bytes: usize },
  Pending,
  /// 没有已提交的推理，零字节哨兵
  Nothing,
}

enum Slot {
  Idle,
  Submitted(Completion),
  Complete(Result<(), DeviceError>),
  Failed,
}

/// 同步与异步推理协议。设备访问全部经由缓冲区池
pub struct InferenceExecutor {
  input_sizes: Vec<usize>,
  output_sizes: Vec<usize>,
  slot: Slot,
}

fn failed(stage: ExecutionStage) -> impl FnOnce(DeviceError) -> EngineError {
  move |source| {
    error!("设备{}失败: {}", stage, source);
    EngineError::DeviceExecutionFailed { stage, source }
  }
}

fn check_sizes(
  direction: BindingDirection,
  expected: &[usize],
  actual: impl Iterator<Item = usize>,
) -> Result<(), EngineError> {
  for (index, (&expected, actual)) in expected.iter().zip(actual).enumerate() {
    if expected != actual {
      error!(
        "{} {} 大小不匹配: 期望 {} 字节, 实际 {} 字节",
        direction, index, expected, actual
      );
      return Err(EngineError::BufferSizeMismatch {
        direction,
        index,
        expected,
        actual,
      });
    }
  }
  Ok(())
}

impl InferenceExecutor {
  pub fn new(layout: &ModelLayout, element_bytes: usize) -> Self {
    InferenceExecutor {
      input_sizes: layout
        .inputs
        .iter()
        .map(|b| b.byte_size(element_bytes))
        .collect(),
      output_sizes: layout
        .outputs
        .iter()
        .map(|b| b.byte_size(element_bytes))
        .collect(),
      slot: Slot::Idle,
    }
  }

  pub fn state(&self) -> AsyncState {
    match self.slot {
      Slot::Idle => AsyncState::Idle,
      Slot::Submitted(_) => AsyncState::Submitted,
      Slot::Complete(_) => AsyncState::Complete,
      Slot::Failed => AsyncState::Failed,
    }
  }

  /// 是否有尚未取回的异步提交
  pub fn is_busy(&self) -> bool {
    matches!(self.slot, Slot::Submitted(_) | Slot::Complete(_))
  }

  /// 先校验全部大小，再校验数量；`None` 表示该方向不参与本次调用
  fn validate(
    &self,
    pool: &DeviceBufferPool,
    inputs: Option<&[&[u8]]>,
    outputs: Option<&[&mut [u8]]>,
  ) -> Result<(), EngineError> {
    if let Some(inputs) = inputs {
      check_sizes(
        BindingDirection::Input,
        &self.input_sizes,
        inputs.iter().map(|b| b.len()),
      )?;
    }
    if let Some(outputs) = outputs {
      check_sizes(
        BindingDirection::Output,
        &self.output_sizes,
        outputs.iter().map(|b| b.len()),
      )?;
    }

    let actual_inputs = inputs.map_or(pool.inputs().len(), |b| b.len());
    let actual_outputs = outputs.map_or(pool.outputs().len(), |b| b.len());
    if actual_inputs != pool.inputs().len() || actual_outputs != pool.outputs().len() {
      return Err(self.count_mismatch(pool, actual_inputs, actual_outputs));
    }
    Ok(())
  }

  fn count_mismatch(&self, pool: &DeviceBufferPool, inputs: usize, outputs: usize) -> EngineError {
    error!(
      "缓冲区数量不匹配: 输入 [实际] {} [期望] {}, 输出 [实际] {} [期望] {}",
      inputs,
      pool.inputs().len(),
      outputs,
      pool.outputs().len()
    );
    EngineError::BufferCountMismatch {
      expected_inputs: pool.inputs().len(),
      actual_inputs: inputs,
      expected_outputs: pool.outputs().len(),
      actual_outputs: outputs,
    }
  }

  fn upload(&self, pool: &DeviceBufferPool, inputs: &[&[u8]]) -> Result<(), EngineError> {
    for (index, input) in inputs.iter().enumerate() {
      pool
        .upload(index, input)
        .map_err(failed(ExecutionStage::CopyToDevice { index }))?;
    }
    Ok(())
  }

  fn download(
    &self,
    pool: &DeviceBufferPool,
    outputs: &mut [&mut [u8]],
  ) -> Result<usize, EngineError> {
    let mut bytes = 0;
    for (index, output) in outputs.iter_mut().enumerate() {
      pool
        .download(index, output)
        .map_err(failed(ExecutionStage::CopyToHost { index }))?;
      bytes += output.len();
    }
    Ok(bytes)
  }

  /// 同步推理：校验 → 拷入 → 执行 → 拷出，严格顺序进行
  pub fn execute(
    &mut self,
    pool: &DeviceBufferPool,
    context: &mut dyn ExecutionContext,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
  ) -> Result<(), EngineError> {
    if self.is_busy() {
      warn!("存在未取回的异步推理, 拒绝同步推理");
      return Err(EngineError::EngineBusy);
    }

    self.validate(pool, Some(inputs), Some(&*outputs))?;

    self.upload(pool, inputs)?;
    debug!("执行推理, 绑定表长度 {}", pool.binding_table().len());
    context
      .execute(pool.binding_table().as_slice())
      .map_err(failed(ExecutionStage::Execute))?;
    self.download(pool, outputs)?;
    Ok(())
  }

  /// 拷入输入并提交到执行流，成功后进入 `Submitted`
  pub fn submit(
    &mut self,
    pool: &DeviceBufferPool,
    context: &mut dyn ExecutionContext,
    inputs: &[&[u8]],
  ) -> Result<(), EngineError> {
    if self.is_busy() {
      return Err(EngineError::AlreadySubmitted);
    }

    self.validate(pool, Some(inputs), None)?;
    self.upload(pool, inputs)?;
    let completion = context
      .enqueue(pool.binding_table().as_slice())
      .map_err(failed(ExecutionStage::Enqueue))?;
    debug!("推理已提交到执行流");
    self.slot = Slot::Submitted(completion);
    Ok(())
  }

  pub fn retrieve(
    &mut self,
    pool: &DeviceBufferPool,
    outputs: &mut [&mut [u8]],
    mode: RetrieveMode,
  ) -> Result<Retrieval, EngineError> {
    let polled = match &self.slot {
      Slot::Idle | Slot::Failed => None,
      Slot::Complete(result) => Some(Some(result.clone())),
      Slot::Submitted(completion) => Some(match mode {
        RetrieveMode::Blocking => Some(completion.wait()),
        RetrieveMode::Poll => completion.try_wait(),
        RetrieveMode::Timeout(timeout) => completion.wait_timeout(timeout),
      }),
    };

    let result = match polled {
      None => {
        warn!("没有已提交的异步推理");
        self.slot = Slot::Failed;
        return Ok(Retrieval::Nothing);
      }
      Some(None) => return Ok(Retrieval::Pending),
      Some(Some(result)) => result,
    };

    if let Err(source) = result {
      self.slot = Slot::Idle;
      return Err(failed(ExecutionStage::Completion)(source));
    }

    // 设备工作已完成；输出校验失败时保持 Complete，调用方可用正确的缓冲区重试
    self.slot = Slot::Complete(Ok(()));
    self.validate(pool, None, Some(&*outputs))?;

    let downloaded = self.download(pool, outputs);
    self.slot = Slot::Idle;
    let bytes = downloaded?;
    debug!("异步推理结果已取回, {} 字节", bytes);
    Ok(Retrieval::Complete { bytes })
  }

  /// 等待未完成的提交自然结束并丢弃结果，用于释放资源之前
  pub fn drain(&mut self) {
    if let Slot::Submitted(completion) = &self.slot {
      debug!("等待未完成的异步推理结束");
      if let Err(e) = completion.wait() {
        warn!("被丢弃的异步推理执行失败: {}", e);
      }
    }
    self.slot = Slot::Idle;
  }
}
