// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/buffer.rs - 设备缓冲区池
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

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::engine::{
  EngineError,
  introspect::ModelBinding,
  runtime::{Device, DeviceError, DevicePtr},
};

/// 独占的一块设备内存，只释放一次
pub struct DeviceBuffer {
  device: Arc<dyn Device>,
  ptr: DevicePtr,
  size: usize,
}

impl DeviceBuffer {
  pub fn allocate(device: &Arc<dyn Device>, size: usize) -> Result<Self, DeviceError> {
    let ptr = device.alloc(size)?;
    Ok(DeviceBuffer {
      device: device.clone(),
      ptr,
      size,
    })
  }

  pub fn ptr(&self) -> DevicePtr {
    self.ptr
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn release(mut self) -> Result<(), DeviceError> {
    self.free()
  }

  fn free(&mut self) -> Result<(), DeviceError> {
    // 先置空句柄再释放，之后的 Drop 不会重复释放
    let ptr = std::mem::replace(&mut self.ptr, DevicePtr::NULL);
    if ptr.is_null() {
      return Ok(());
    }
    self.device.free(ptr)
  }
}

impl Drop for DeviceBuffer {
  fn drop(&mut self) {
    if let Err(e) = self.free() {
      warn!("释放设备缓冲区失败: {}", e);
    }
  }
}

impl std::fmt::Debug for DeviceBuffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DeviceBuffer")
      .field("ptr", &format_args!("{:#x}", self.ptr.addr()))
      .field("size", &self.size)
      .finish()
  }
}

/// 同一方向的全部设备缓冲区，按绑定顺序排列
#[derive(Debug, Default)]
pub struct BufferSet {
  buffers: Vec<DeviceBuffer>,
}

impl BufferSet {
  pub fn len(&self) -> usize {
    self.buffers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buffers.is_empty()
  }

  pub fn ptrs(&self) -> impl Iterator<Item = DevicePtr> + '_ {
    self.buffers.iter().map(DeviceBuffer::ptr)
  }

  pub fn sizes(&self) -> Vec<usize> {
    self.buffers.iter().map(DeviceBuffer::size).collect()
  }

  fn allocate(
    device: &Arc<dyn Device>,
    bindings: &[ModelBinding],
    element_bytes: usize,
  ) -> Result<Self, EngineError> {
    let mut set = BufferSet {
      buffers: Vec::with_capacity(bindings.len()),
    };
    for binding in bindings {
      let bytes = binding.byte_size(element_bytes);
      match DeviceBuffer::allocate(device, bytes) {
        Ok(buffer) => {
          debug!(
            "{} [{}] {}: 分配 {:.2} KB",
            binding.direction,
            binding.index,
            binding.name,
            bytes as f64 / 1024.0
          );
          set.buffers.push(buffer);
        }
        Err(source) => {
          error!(
            "{} 缓冲区 {} 分配失败 ({} 字节): {}",
            binding.direction, binding.name, bytes, source
          );
          if let Err(release) = set.release_all() {
            warn!("回滚已分配的缓冲区失败: {}", release);
          }
          return Err(EngineError::DeviceOutOfMemory {
            binding: binding.name.clone(),
            bytes,
            source,
          });
        }
      }
    }
    Ok(set)
  }

  /// 释放全部缓冲区并清空，返回遇到的第一个错误
  fn release_all(&mut self) -> Result<(), DeviceError> {
    let mut first_error = None;
    for buffer in self.buffers.drain(..) {
      if let Err(e) = buffer.release() {
        warn!("释放设备缓冲区失败: {}", e);
        first_error.get_or_insert(e);
      }
    }
    first_error.map_or(Ok(()), Err)
  }
}

/// 执行时使用的地址表：输入在前，输出在后，不持有内存
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
  addresses: Vec<DevicePtr>,
  num_inputs: usize,
}

impl BindingTable {
  pub fn build(inputs: &BufferSet, outputs: &BufferSet) -> Self {
    let addresses = inputs.ptrs().chain(outputs.ptrs()).collect();
    BindingTable {
      addresses,
      num_inputs: inputs.len(),
    }
  }

  pub fn len(&self) -> usize {
    self.addresses.len()
  }

  pub fn is_empty(&self) -> bool {
    self.addresses.is_empty()
  }

  pub fn num_inputs(&self) -> usize {
    self.num_inputs
  }

  pub fn resolve(&self, index: usize) -> Option<DevicePtr> {
    self.addresses.get(index).copied()
  }

  pub fn as_slice(&self) -> &[DevicePtr] {
    &self.addresses
  }
}

pub struct DeviceBufferPool {
  device: Arc<dyn Device>,
  element_bytes: usize,
  inputs: BufferSet,
  outputs: BufferSet,
  table: BindingTable,
}

impl DeviceBufferPool {
  pub fn new(device: Arc<dyn Device>, element_bytes: usize) -> Self {
    DeviceBufferPool {
      device,
      element_bytes,
      inputs: BufferSet::default(),
      outputs: BufferSet::default(),
      table: BindingTable::default(),
    }
  }

  pub fn is_allocated(&self) -> bool {
    !self.inputs.is_empty() || !self.outputs.is_empty()
  }

  pub fn element_bytes(&self) -> usize {
    self.element_bytes
  }

  pub fn inputs(&self) -> &BufferSet {
    &self.inputs
  }

  pub fn outputs(&self) -> &BufferSet {
    &self.outputs
  }

  pub fn binding_table(&self) -> &BindingTable {
    &self.table
  }

  /// 为每个绑定分配设备内存。任何一次分配失败都会回滚本次调用已分配的全部内存
  pub fn allocate(
    &mut self,
    inputs: &[ModelBinding],
    outputs: &[ModelBinding],
  ) -> Result<(), EngineError> {
    if self.is_allocated() {
      error!("设备缓冲区已分配, 请先调用 deallocate()");
      return Err(EngineError::AlreadyAllocated);
    }

    if inputs.is_empty() || outputs.is_empty() {
      error!(
        "模型输入输出数量无效 ({} 个输入, {} 个输出)",
        inputs.len(),
        outputs.len()
      );
      return Err(EngineError::InvalidIOCounts {
        inputs: inputs.len(),
        outputs: outputs.len(),
      });
    }

    let input_set = BufferSet::allocate(&self.device, inputs, self.element_bytes)?;
    let output_set = match BufferSet::allocate(&self.device, outputs, self.element_bytes) {
      Ok(set) => set,
      Err(e) => {
        let mut input_set = input_set;
        if let Err(release) = input_set.release_all() {
          warn!("回滚输入缓冲区失败: {}", release);
        }
        return Err(e);
      }
    };

    self.table = BindingTable::build(&input_set, &output_set);
    self.inputs = input_set;
    self.outputs = output_set;

    info!(
      "已分配 {} 个输入缓冲区和 {} 个输出缓冲区, 绑定表长度 {}",
      self.inputs.len(),
      self.outputs.len(),
      self.table.len()
    );
    Ok(())
  }

  /// 释放全部缓冲区并清空绑定表，对空池调用是安全的
  pub fn deallocate(&mut self) -> Result<(), DeviceError> {
    if !self.is_allocated() {
      return Ok(());
    }

    self.table = BindingTable::default();
    let inputs = self.inputs.release_all();
    let outputs = self.outputs.release_all();
    info!("已释放全部设备缓冲区");
    inputs.and(outputs)
  }

  pub(crate) fn upload(&self, index: usize, src: &[u8]) -> Result<(), DeviceError> {
    let ptr = self.inputs.buffers.get(index).map_or(DevicePtr::NULL, DeviceBuffer::ptr);
    self.device.copy_to_device(ptr, src)
  }

  pub(crate) fn download(&self, index: usize, dst: &mut [u8]) -> Result<(), DeviceError> {
    let ptr = self.outputs.buffers.get(index).map_or(DevicePtr::NULL, DeviceBuffer::ptr);
    self.device.copy_to_host(dst, ptr)
  }
}

impl Drop for DeviceBufferPool {
  fn drop(&mut self) {
    if let Err(e) = self.deallocate() {
      warn!("释放设备缓冲区池失败: {}", e);
    }
  }
}
