// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine.rs - 推理引擎
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

//! 单模型推理引擎。
//!
//! 引擎持有运行时句柄、设备缓冲区与执行状态，状态转换：
//! `Unloaded → Loaded → Ready → Deallocated → ShutDown`。
//! 模型元数据在加载后不可变，可在多线程中无锁读取；
//! 推理同一时刻只允许一个，并发调用立即返回 [`EngineError::EngineBusy`]。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod buffer;
pub mod executor;
pub mod host;
pub mod introspect;
pub mod lifecycle;
pub mod runtime;

use self::buffer::{BindingTable, DeviceBufferPool};
use self::executor::{AsyncState, ExecutionStage, InferenceExecutor, RetrieveMode, Retrieval};
use self::introspect::{BindingDirection, ModelBinding, ModelLayout, introspect};
use self::lifecycle::EngineLifecycle;
use self::runtime::{DeviceError, Runtime};

/// 默认元素宽度，按 32 位浮点计算
pub const DEFAULT_ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型文件读取失败 {path}: {source}")]
  ModelRead {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("运行时错误: {0}")]
  Runtime(DeviceError),
  #[error("引擎已初始化, 加载被中止")]
  AlreadyInitialized,
  #[error("绑定 {binding} 的第 {axis} 维无效: {extent}")]
  InvalidModelDimension {
    binding: String,
    axis: usize,
    extent: i64,
  },
  #[error("绑定 {binding} 没有任何维度")]
  EmptyBindingSet { binding: String },
  #[error("输入绑定 {binding} 位于输出绑定之后")]
  InterleavedBindings { binding: String },
  #[error("运行时缺少第 {index} 个绑定")]
  MissingBinding { index: usize },
  #[error("设备缓冲区已分配")]
  AlreadyAllocated,
  #[error("模型输入输出数量无效 ({inputs} 个输入, {outputs} 个输出)")]
  InvalidIOCounts { inputs: usize, outputs: usize },
  #[error("为 {binding} 分配 {bytes} 字节设备内存失败: {source}")]
  DeviceOutOfMemory {
    binding: String,
    bytes: usize,
    #[source]
    source: DeviceError,
  },
  #[error("{direction} {index} 大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch {
    direction: BindingDirection,
    index: usize,
    expected: usize,
    actual: usize,
  },
  #[error(
    "缓冲区数量不匹配: 输入 {actual_inputs}/{expected_inputs}, 输出 {actual_outputs}/{expected_outputs}"
  )]
  BufferCountMismatch {
    expected_inputs: usize,
    actual_inputs: usize,
    expected_outputs: usize,
    actual_outputs: usize,
  },
  #[error("设备{stage}失败: {source}")]
  DeviceExecutionFailed {
    stage: ExecutionStage,
    #[source]
    source: DeviceError,
  },
  #[error("已有未取回的异步推理")]
  AlreadySubmitted,
  #[error("引擎正忙")]
  EngineBusy,
  #[error("引擎状态 {state} 下不可执行该操作")]
  NotReady { state: EngineState },
  #[error("引擎状态锁已中毒")]
  Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
  Unloaded,
  Loaded,
  /// 缓冲区已分配，可以推理
  Ready,
  Deallocated,
  ShutDown,
}

impl fmt::Display for EngineState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      EngineState::Unloaded => "Unloaded",
      EngineState::Loaded => "Loaded",
      EngineState::Ready => "Ready",
      EngineState::Deallocated => "Deallocated",
      EngineState::ShutDown => "ShutDown",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
  /// 每个张量元素的字节数
  pub element_bytes: usize,
}

impl Default for EngineOptions {
  fn default() -> Self {
    EngineOptions {
      element_bytes: DEFAULT_ELEMENT_BYTES,
    }
  }
}

// 字段顺序即析构顺序：缓冲区先于运行时句柄释放
struct EngineInner {
  state: EngineState,
  executor: InferenceExecutor,
  pool: DeviceBufferPool,
  lifecycle: EngineLifecycle,
}

impl EngineInner {
  fn require_ready(&self) -> Result<(), EngineError> {
    if self.state != EngineState::Ready {
      return Err(EngineError::NotReady { state: self.state });
    }
    Ok(())
  }

  fn shutdown(&mut self) {
    if matches!(self.state, EngineState::Unloaded | EngineState::ShutDown) {
      return;
    }

    self.executor.drain();
    if let Err(e) = self.pool.deallocate() {
      warn!("释放设备缓冲区失败: {}", e);
    }
    self.lifecycle.shutdown();
    self.state = EngineState::ShutDown;
  }
}

pub struct Engine {
  layout: ModelLayout,
  options: EngineOptions,
  inner: Mutex<EngineInner>,
}

impl Engine {
  pub fn load(runtime: Box<dyn Runtime>, path: impl AsRef<Path>) -> Result<Self, EngineError> {
    Self::load_with_options(runtime, path, EngineOptions::default())
  }

  pub fn load_with_options(
    runtime: Box<dyn Runtime>,
    path: impl AsRef<Path>,
    options: EngineOptions,
  ) -> Result<Self, EngineError> {
    let path = path.as_ref();
    info!("加载模型文件: {}", path.display());
    let blob = std::fs::read(path).map_err(|source| EngineError::ModelRead {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(
      "模型文件大小: {:.2} MB",
      blob.len() as f64 / (1024.0 * 1024.0)
    );
    Self::from_blob(runtime, &blob, options)
  }

  /// 加载并分配缓冲区。分配失败时已加载的资源按逆序释放，
  /// 需要在失败后重试分配的调用方应使用 [`Engine::prepare`]
  pub fn from_blob(
    runtime: Box<dyn Runtime>,
    blob: &[u8],
    options: EngineOptions,
  ) -> Result<Self, EngineError> {
    let engine = Self::prepare(runtime, blob, options)?;
    engine.allocate()?;
    Ok(engine)
  }

  /// 加载运行时与模型并解析绑定，不分配设备缓冲区，引擎停在 `Loaded`
  pub fn prepare(
    runtime: Box<dyn Runtime>,
    blob: &[u8],
    options: EngineOptions,
  ) -> Result<Self, EngineError> {
    let mut lifecycle = EngineLifecycle::new();
    lifecycle.load(runtime, blob)?;

    let layout = match lifecycle.model() {
      Some(model) => introspect(model)?,
      None => {
        return Err(EngineError::NotReady {
          state: EngineState::Unloaded,
        });
      }
    };
    let device = lifecycle.device().ok_or(EngineError::NotReady {
      state: EngineState::Unloaded,
    })?;

    for binding in layout.inputs.iter().chain(&layout.outputs) {
      info!(
        "{} {} 元素数: {} ({:.2} KB) 步长: {:?}",
        binding.direction,
        binding.name,
        binding.element_count,
        binding.byte_size(options.element_bytes) as f64 / 1024.0,
        binding.strides()
      );
    }

    let pool = DeviceBufferPool::new(device, options.element_bytes);
    let executor = InferenceExecutor::new(&layout, options.element_bytes);
    Ok(Engine {
      layout,
      options,
      inner: Mutex::new(EngineInner {
        state: EngineState::Loaded,
        executor,
        pool,
        lifecycle,
      }),
    })
  }

  /// 推理路径使用：忙时立即失败
  fn try_lock(&self) -> Result<MutexGuard<'_, EngineInner>, EngineError> {
    match self.inner.try_lock() {
      Ok(guard) => Ok(guard),
      Err(TryLockError::WouldBlock) => Err(EngineError::EngineBusy),
      Err(TryLockError::Poisoned(_)) => {
        error!("引擎状态锁已中毒");
        Err(EngineError::Poisoned)
      }
    }
  }

  /// 资源管理路径使用：等待正在进行的推理结束
  fn lock(&self) -> MutexGuard<'_, EngineInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn state(&self) -> EngineState {
    self.lock().state
  }

  pub fn async_state(&self) -> AsyncState {
    self.lock().executor.state()
  }

  pub fn options(&self) -> EngineOptions {
    self.options
  }

  pub fn layout(&self) -> &ModelLayout {
    &self.layout
  }

  pub fn inputs(&self) -> &[ModelBinding] {
    &self.layout.inputs
  }

  pub fn outputs(&self) -> &[ModelBinding] {
    &self.layout.outputs
  }

  pub fn num_inputs(&self) -> usize {
    self.layout.inputs.len()
  }

  pub fn num_outputs(&self) -> usize {
    self.layout.outputs.len()
  }

  pub fn input_shapes(&self) -> Vec<&[u64]> {
    self.layout.inputs.iter().map(|b| b.shape.as_slice()).collect()
  }

  pub fn output_shapes(&self) -> Vec<&[u64]> {
    self.layout.outputs.iter().map(|b| b.shape.as_slice()).collect()
  }

  pub fn input_element_counts(&self) -> Vec<u64> {
    self.layout.inputs.iter().map(|b| b.element_count).collect()
  }

  pub fn output_element_counts(&self) -> Vec<u64> {
    self.layout.outputs.iter().map(|b| b.element_count).collect()
  }

  pub fn input_size_bytes(&self) -> Vec<usize> {
    let element_bytes = self.options.element_bytes;
    self.layout.inputs.iter().map(|b| b.byte_size(element_bytes)).collect()
  }

  pub fn output_size_bytes(&self) -> Vec<usize> {
    let element_bytes = self.options.element_bytes;
    self.layout.outputs.iter().map(|b| b.byte_size(element_bytes)).collect()
  }

  /// 当前绑定表的快照，未分配时为空
  pub fn binding_table(&self) -> BindingTable {
    self.lock().pool.binding_table().clone()
  }

  /// 同步推理，调用线程阻塞至输出写回主机缓冲区
  pub fn infer(&self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), EngineError> {
    let mut guard = self.try_lock()?;
    guard.require_ready()?;
    let EngineInner {
      lifecycle,
      pool,
      executor,
      ..
    } = &mut *guard;
    let context = lifecycle.context_mut().ok_or(EngineError::NotReady {
      state: EngineState::Unloaded,
    })?;
    executor.execute(pool, context, inputs, outputs)
  }

  /// 拷入输入并提交异步推理，之后调用方可以去做其他工作
  pub fn submit(&self, inputs: &[&[u8]]) -> Result<(), EngineError> {
    let mut guard = self.try_lock()?;
    guard.require_ready()?;
    let EngineInner {
      lifecycle,
      pool,
      executor,
      ..
    } = &mut *guard;
    let context = lifecycle.context_mut().ok_or(EngineError::NotReady {
      state: EngineState::Unloaded,
    })?;
    executor.submit(pool, context, inputs)
  }

  pub fn retrieve(
    &self,
    outputs: &mut [&mut [u8]],
    mode: RetrieveMode,
  ) -> Result<Retrieval, EngineError> {
    let mut guard = self.try_lock()?;
    guard.require_ready()?;
    let EngineInner { pool, executor, .. } = &mut *guard;
    executor.retrieve(pool, outputs, mode)
  }

  /// 分配设备缓冲区，在 `Loaded` 或 `Deallocated` 下有效。
  /// 内存不足时已分配的部分全部回滚，状态不变，可以再次调用
  pub fn allocate(&self) -> Result<(), EngineError> {
    let mut inner = self.lock();
    match inner.state {
      EngineState::Loaded | EngineState::Deallocated => {}
      EngineState::Ready => return Err(EngineError::AlreadyAllocated),
      state => return Err(EngineError::NotReady { state }),
    }
    inner
      .pool
      .allocate(&self.layout.inputs, &self.layout.outputs)?;
    inner.state = EngineState::Ready;
    Ok(())
  }

  /// 释放设备缓冲区。重复调用是安全的；存在未取回的异步推理时拒绝释放
  pub fn deallocate(&self) -> Result<(), EngineError> {
    let mut inner = self.lock();
    if inner.state != EngineState::Ready {
      return Ok(());
    }
    if inner.executor.is_busy() {
      warn!("存在未取回的异步推理, 拒绝释放缓冲区");
      return Err(EngineError::EngineBusy);
    }
    let released = inner.pool.deallocate();
    inner.state = EngineState::Deallocated;
    released.map_err(EngineError::Runtime)
  }

  /// 释放缓冲区与运行时资源，等待未完成的设备工作自然结束。可重复调用
  pub fn shutdown(&self) {
    self.lock().shutdown();
  }

  pub fn unload(&self) {
    self.shutdown();
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    self
      .inner
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .shutdown();
  }
}

impl fmt::Debug for Engine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Engine")
      .field("layout", &self.layout)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
