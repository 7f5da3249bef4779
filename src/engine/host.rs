// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/host.rs - 主机内存模拟运行时
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

//! 以主机内存模拟设备的运行时。
//!
//! 模型文件为 JSON：绑定列表加上一个计算核描述。
//! 计算核只负责产生输出张量，可以是全零、固定回放或自定义实现。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::engine::runtime::{
  CompiledModel, Completion, Device, DeviceError, DevicePtr, ExecutionContext, RawBinding,
  Runtime,
};

const HOST_BASE_ADDRESS: u64 = 0x1000;
const HOST_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBindingSpec {
  pub name: String,
  pub input: bool,
  pub shape: Vec<i64>,
}

impl HostBindingSpec {
  pub fn input(name: &str, shape: &[i64]) -> Self {
    HostBindingSpec {
      name: name.to_string(),
      input: true,
      shape: shape.to_vec(),
    }
  }

  pub fn output(name: &str, shape: &[i64]) -> Self {
    HostBindingSpec {
      name: name.to_string(),
      input: false,
      shape: shape.to_vec(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "data", rename_all = "lowercase")]
pub enum HostTensor {
  F32(Vec<f32>),
  I32(Vec<i32>),
}

impl HostTensor {
  pub fn to_bytes(&self) -> Vec<u8> {
    match self {
      HostTensor::F32(values) => values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
      HostTensor::I32(values) => values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostKernelSpec {
  /// 输出全部置零
  #[default]
  Zero,
  /// 每次执行都写出相同的输出张量，按输出顺序排列
  Replay { outputs: Vec<HostTensor> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostModelSpec {
  pub bindings: Vec<HostBindingSpec>,
  #[serde(default)]
  pub kernel: HostKernelSpec,
}

impl HostModelSpec {
  pub fn new(bindings: Vec<HostBindingSpec>) -> Self {
    HostModelSpec {
      bindings,
      kernel: HostKernelSpec::Zero,
    }
  }

  pub fn with_kernel(mut self, kernel: HostKernelSpec) -> Self {
    self.kernel = kernel;
    self
  }

  pub fn to_blob(&self) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(self)
  }

  pub fn from_blob(blob: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(blob)
  }
}

/// 计算核：读取输入，写出输出。输出缓冲区带有设备上的原有内容
pub trait HostKernel: Send + Sync {
  fn run(&self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), String>;
}

struct ZeroKernel;

impl HostKernel for ZeroKernel {
  fn run(&self, _inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), String> {
    for output in outputs.iter_mut() {
      output.fill(0);
    }
    Ok(())
  }
}

struct ReplayKernel {
  outputs: Vec<Vec<u8>>,
}

impl HostKernel for ReplayKernel {
  fn run(&self, _inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), String> {
    if outputs.len() != self.outputs.len() {
      return Err(format!(
        "回放张量数量 {} 与输出数量 {} 不一致",
        self.outputs.len(),
        outputs.len()
      ));
    }
    for (index, (dst, src)) in outputs.iter_mut().zip(&self.outputs).enumerate() {
      if dst.len() != src.len() {
        return Err(format!(
          "回放张量 {} 为 {} 字节, 输出缓冲区为 {} 字节",
          index,
          src.len(),
          dst.len()
        ));
      }
      dst.copy_from_slice(src);
    }
    Ok(())
  }
}

impl HostKernelSpec {
  pub fn build(&self) -> Arc<dyn HostKernel> {
    match self {
      HostKernelSpec::Zero => Arc::new(ZeroKernel),
      HostKernelSpec::Replay { outputs } => Arc::new(ReplayKernel {
        outputs: outputs.iter().map(HostTensor::to_bytes).collect(),
      }),
    }
  }
}

/// 设备计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostDeviceCounters {
  pub allocations: usize,
  pub frees: usize,
  pub live_allocations: usize,
  pub live_bytes: usize,
  pub copies_to_device: usize,
  pub copies_to_host: usize,
  pub executions: usize,
}

pub struct HostDevice {
  memory: Mutex<HashMap<u64, Vec<u8>>>,
  next_address: AtomicU64,
  capacity: Option<usize>,
  allocations: AtomicUsize,
  frees: AtomicUsize,
  copies_to_device: AtomicUsize,
  copies_to_host: AtomicUsize,
  executions: AtomicUsize,
}

impl Default for HostDevice {
  fn default() -> Self {
    HostDevice {
      memory: Mutex::new(HashMap::new()),
      next_address: AtomicU64::new(HOST_BASE_ADDRESS),
      capacity: None,
      allocations: AtomicUsize::new(0),
      frees: AtomicUsize::new(0),
      copies_to_device: AtomicUsize::new(0),
      copies_to_host: AtomicUsize::new(0),
      executions: AtomicUsize::new(0),
    }
  }
}

impl HostDevice {
  pub fn new() -> Self {
    Self::default()
  }

  /// 限制设备内存总量，超出时分配失败
  pub fn with_capacity(capacity: usize) -> Self {
    HostDevice {
      capacity: Some(capacity),
      ..Self::default()
    }
  }

  fn memory(&self) -> Result<MutexGuard<'_, HashMap<u64, Vec<u8>>>, DeviceError> {
    self.memory.lock().map_err(|_| DeviceError::Poisoned)
  }

  pub fn counters(&self) -> HostDeviceCounters {
    let (live_allocations, live_bytes) = match self.memory.lock() {
      Ok(memory) => (memory.len(), memory.values().map(Vec::len).sum::<usize>()),
      Err(poisoned) => {
        let memory = poisoned.into_inner();
        (memory.len(), memory.values().map(Vec::len).sum::<usize>())
      }
    };
    HostDeviceCounters {
      allocations: self.allocations.load(Ordering::SeqCst),
      frees: self.frees.load(Ordering::SeqCst),
      live_allocations,
      live_bytes,
      copies_to_device: self.copies_to_device.load(Ordering::SeqCst),
      copies_to_host: self.copies_to_host.load(Ordering::SeqCst),
      executions: self.executions.load(Ordering::SeqCst),
    }
  }

  /// 按绑定表运行计算核。输入先整体读出，计算核在锁外运行，输出随后写回
  fn run_kernel(
    &self,
    kernel: &dyn HostKernel,
    bindings: &[DevicePtr],
    is_input: &[bool],
  ) -> Result<(), DeviceError> {
    if bindings.len() != is_input.len() {
      return Err(DeviceError::Execution(format!(
        "绑定表长度 {} 与模型绑定数 {} 不一致",
        bindings.len(),
        is_input.len()
      )));
    }

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut output_ptrs = Vec::new();
    {
      let memory = self.memory()?;
      for (ptr, &input) in bindings.iter().zip(is_input) {
        let buffer = memory
          .get(&ptr.addr())
          .ok_or(DeviceError::InvalidPointer(ptr.addr()))?;
        if input {
          inputs.push(buffer.clone());
        } else {
          outputs.push(buffer.clone());
          output_ptrs.push(*ptr);
        }
      }
    }

    {
      let input_refs: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
      let mut output_refs: Vec<&mut [u8]> = outputs.iter_mut().map(Vec::as_mut_slice).collect();
      kernel
        .run(&input_refs, &mut output_refs)
        .map_err(DeviceError::Execution)?;
    }

    let mut memory = self.memory()?;
    for (ptr, data) in output_ptrs.iter().zip(outputs) {
      let buffer = memory
        .get_mut(&ptr.addr())
        .ok_or(DeviceError::InvalidPointer(ptr.addr()))?;
      buffer.copy_from_slice(&data);
    }
    self.executions.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

impl Device for HostDevice {
  fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
    let mut memory = self.memory()?;
    if let Some(capacity) = self.capacity {
      let used: usize = memory.values().map(Vec::len).sum();
      if used.saturating_add(bytes) > capacity {
        return Err(DeviceError::OutOfMemory { requested: bytes });
      }
    }

    let out_of_memory = || {
      error!("主机设备无法分配 {} 字节", bytes);
      DeviceError::OutOfMemory { requested: bytes }
    };
    let span = u64::try_from(bytes)
      .ok()
      .and_then(|b| b.max(1).div_ceil(HOST_ALIGNMENT).checked_mul(HOST_ALIGNMENT))
      .ok_or_else(out_of_memory)?;
    let mut buffer = Vec::new();
    buffer
      .try_reserve_exact(bytes)
      .map_err(|_| out_of_memory())?;
    buffer.resize(bytes, 0u8);

    let addr = self.next_address.fetch_add(span, Ordering::SeqCst);
    memory.insert(addr, buffer);
    self.allocations.fetch_add(1, Ordering::SeqCst);
    Ok(DevicePtr::new(addr))
  }

  fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
    let mut memory = self.memory()?;
    memory
      .remove(&ptr.addr())
      .ok_or(DeviceError::InvalidPointer(ptr.addr()))?;
    self.frees.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
    let mut memory = self.memory()?;
    let buffer = memory
      .get_mut(&dst.addr())
      .ok_or(DeviceError::InvalidPointer(dst.addr()))?;
    if buffer.len() != src.len() {
      return Err(DeviceError::CopyLength {
        device: buffer.len(),
        host: src.len(),
      });
    }
    buffer.copy_from_slice(src);
    self.copies_to_device.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DeviceError> {
    let memory = self.memory()?;
    let buffer = memory
      .get(&src.addr())
      .ok_or(DeviceError::InvalidPointer(src.addr()))?;
    if buffer.len() != dst.len() {
      return Err(DeviceError::CopyLength {
        device: buffer.len(),
        host: dst.len(),
      });
    }
    dst.copy_from_slice(buffer);
    self.copies_to_host.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

struct HostModel {
  spec: HostModelSpec,
  kernel: Arc<dyn HostKernel>,
  device: Arc<HostDevice>,
}

impl CompiledModel for HostModel {
  fn num_bindings(&self) -> usize {
    self.spec.bindings.len()
  }

  fn binding(&self, index: usize) -> Option<RawBinding> {
    self.spec.bindings.get(index).map(|b| RawBinding {
      name: b.name.clone(),
      is_input: b.input,
      dims: b.shape.clone(),
    })
  }

  fn create_execution_context(&self) -> Result<Box<dyn ExecutionContext>, DeviceError> {
    Ok(Box::new(HostContext {
      device: self.device.clone(),
      kernel: self.kernel.clone(),
      is_input: self.spec.bindings.iter().map(|b| b.input).collect(),
    }))
  }
}

struct HostContext {
  device: Arc<HostDevice>,
  kernel: Arc<dyn HostKernel>,
  is_input: Vec<bool>,
}

impl ExecutionContext for HostContext {
  fn execute(&mut self, bindings: &[DevicePtr]) -> Result<(), DeviceError> {
    self
      .device
      .run_kernel(self.kernel.as_ref(), bindings, &self.is_input)
  }

  fn enqueue(&mut self, bindings: &[DevicePtr]) -> Result<Completion, DeviceError> {
    let (signal, completion) = Completion::channel();
    let device = self.device.clone();
    let kernel = self.kernel.clone();
    let is_input = self.is_input.clone();
    let bindings = bindings.to_vec();

    thread::Builder::new()
      .name("host-stream".to_string())
      .spawn(move || {
        let result = device.run_kernel(kernel.as_ref(), &bindings, &is_input);
        if let Err(e) = &result {
          error!("执行流上的推理失败: {}", e);
        }
        signal.complete(result);
      })
      .map_err(|e| DeviceError::Execution(format!("无法启动执行流: {}", e)))?;
    Ok(completion)
  }
}

/// 主机运行时。默认计算核取自模型文件，也可以整体替换
#[derive(Clone)]
pub struct HostRuntime {
  device: Arc<HostDevice>,
  kernel: Option<Arc<dyn HostKernel>>,
}

impl Default for HostRuntime {
  fn default() -> Self {
    HostRuntime {
      device: Arc::new(HostDevice::new()),
      kernel: None,
    }
  }
}

impl HostRuntime {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_device(device: Arc<HostDevice>) -> Self {
    HostRuntime {
      device,
      kernel: None,
    }
  }

  pub fn with_kernel(mut self, kernel: Arc<dyn HostKernel>) -> Self {
    self.kernel = Some(kernel);
    self
  }

  pub fn host_device(&self) -> Arc<HostDevice> {
    self.device.clone()
  }
}

impl Runtime for HostRuntime {
  fn device(&self) -> Arc<dyn Device> {
    self.device.clone()
  }

  fn deserialize_model(&self, blob: &[u8]) -> Result<Box<dyn CompiledModel>, DeviceError> {
    let spec =
      HostModelSpec::from_blob(blob).map_err(|e| DeviceError::Deserialize(e.to_string()))?;
    debug!("主机模型: {} 个绑定", spec.bindings.len());
    let kernel = match &self.kernel {
      Some(kernel) => kernel.clone(),
      None => spec.kernel.build(),
    };
    Ok(Box::new(HostModel {
      spec,
      kernel,
      device: self.device.clone(),
    }))
  }
}
