// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/runtime.rs - 模型运行时接口
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

//! 外部模型运行时的抽象边界。
//!
//! 引擎只通过这里的 trait 与运行时交互：运行时负责反序列化模型、
//! 提供设备内存以及按绑定表执行推理，其内部实现对引擎不透明。

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::time::Duration;

use thiserror::Error;

/// 设备内存地址，不持有所有权
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
  pub const NULL: DevicePtr = DevicePtr(0);

  pub fn new(addr: u64) -> Self {
    DevicePtr(addr)
  }

  pub fn addr(&self) -> u64 {
    self.0
  }

  pub fn is_null(&self) -> bool {
    self.0 == 0
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
  #[error("设备内存不足: 请求 {requested} 字节")]
  OutOfMemory { requested: usize },
  #[error("无效的设备地址: {0:#x}")]
  InvalidPointer(u64),
  #[error("拷贝长度不匹配: 设备缓冲区 {device} 字节, 主机缓冲区 {host} 字节")]
  CopyLength { device: usize, host: usize },
  #[error("模型反序列化失败: {0}")]
  Deserialize(String),
  #[error("执行失败: {0}")]
  Execution(String),
  #[error("执行流已断开")]
  Disconnected,
  #[error("设备状态锁已中毒")]
  Poisoned,
}

/// 运行时上报的单个绑定的原始信息，维度可能为非法值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBinding {
  pub name: String,
  pub is_input: bool,
  pub dims: Vec<i64>,
}

pub trait Device: Send + Sync {
  fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError>;
  fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;
  fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError>;
  fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DeviceError>;
}

pub trait ExecutionContext: Send {
  /// 阻塞执行，返回时输出缓冲区已写入
  fn execute(&mut self, bindings: &[DevicePtr]) -> Result<(), DeviceError>;

  /// 将执行提交到设备流，立即返回完成句柄
  fn enqueue(&mut self, bindings: &[DevicePtr]) -> Result<Completion, DeviceError>;
}

pub trait CompiledModel: Send {
  fn num_bindings(&self) -> usize;
  fn binding(&self, index: usize) -> Option<RawBinding>;
  fn create_execution_context(&self) -> Result<Box<dyn ExecutionContext>, DeviceError>;
}

pub trait Runtime: Send {
  fn device(&self) -> Arc<dyn Device>;
  fn deserialize_model(&self, blob: &[u8]) -> Result<Box<dyn CompiledModel>, DeviceError>;
}

/// 一次性完成通知的发送端，由运行时在设备工作结束时调用
pub struct CompletionSignal {
  sender: SyncSender<Result<(), DeviceError>>,
}

impl CompletionSignal {
  pub fn complete(self, result: Result<(), DeviceError>) {
    // 接收端已丢弃时结果无人关心
    let _ = self.sender.send(result);
  }
}

/// 一次性完成句柄，基于单槽通道
pub struct Completion {
  receiver: Receiver<Result<(), DeviceError>>,
}

impl Completion {
  pub fn channel() -> (CompletionSignal, Completion) {
    let (sender, receiver) = mpsc::sync_channel(1);
    (CompletionSignal { sender }, Completion { receiver })
  }

  /// 阻塞直到设备工作结束
  pub fn wait(&self) -> Result<(), DeviceError> {
    self.receiver.recv().unwrap_or(Err(DeviceError::Disconnected))
  }

  /// 非阻塞查询，未完成时返回 `None`
  pub fn try_wait(&self) -> Option<Result<(), DeviceError>> {
    match self.receiver.try_recv() {
      Ok(result) => Some(result),
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Disconnected) => Some(Err(DeviceError::Disconnected)),
    }
  }

  /// 最多等待 `timeout`，超时返回 `None`，设备工作不受影响
  pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), DeviceError>> {
    match self.receiver.recv_timeout(timeout) {
      Ok(result) => Some(result),
      Err(RecvTimeoutError::Timeout) => None,
      Err(RecvTimeoutError::Disconnected) => Some(Err(DeviceError::Disconnected)),
    }
  }
}

impl std::fmt::Debug for Completion {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Completion").finish_non_exhaustive()
  }
}
