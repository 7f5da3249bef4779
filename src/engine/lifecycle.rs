// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/lifecycle.rs - 运行时句柄生命周期
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

use tracing::{debug, info};

use crate::engine::{
  EngineError,
  runtime::{CompiledModel, Device, ExecutionContext, Runtime},
};

/// 按 运行时 → 模型 → 执行上下文 的顺序持有外部句柄，释放时逆序
#[derive(Default)]
pub struct EngineLifecycle {
  runtime: Option<Box<dyn Runtime>>,
  model: Option<Box<dyn CompiledModel>>,
  context: Option<Box<dyn ExecutionContext>>,
}

impl EngineLifecycle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_loaded(&self) -> bool {
    self.runtime.is_some()
  }

  pub fn load(&mut self, runtime: Box<dyn Runtime>, blob: &[u8]) -> Result<(), EngineError> {
    if self.is_loaded() {
      return Err(EngineError::AlreadyInitialized);
    }

    debug!(
      "反序列化模型, 大小: {:.2} MB",
      blob.len() as f64 / (1024.0 * 1024.0)
    );
    let model = runtime
      .deserialize_model(blob)
      .map_err(EngineError::Runtime)?;

    debug!("创建执行上下文");
    let context = model
      .create_execution_context()
      .map_err(EngineError::Runtime)?;

    self.runtime = Some(runtime);
    self.model = Some(model);
    self.context = Some(context);
    info!(
      "运行时资源已加载, 绑定数量: {}",
      self.model.as_ref().map_or(0, |m| m.num_bindings())
    );
    Ok(())
  }

  pub fn model(&self) -> Option<&dyn CompiledModel> {
    self.model.as_deref()
  }

  pub fn context_mut(&mut self) -> Option<&mut (dyn ExecutionContext + 'static)> {
    self.context.as_deref_mut()
  }

  pub fn device(&self) -> Option<Arc<dyn Device>> {
    self.runtime.as_ref().map(|runtime| runtime.device())
  }

  /// 逆序释放：执行上下文、模型、运行时。未加载时什么也不做
  pub fn shutdown(&mut self) {
    if !self.is_loaded() {
      return;
    }

    drop(self.context.take());
    drop(self.model.take());
    drop(self.runtime.take());
    info!("运行时资源已释放");
  }
}

impl Drop for EngineLifecycle {
  fn drop(&mut self) {
    self.shutdown();
  }
}
