// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/inspect_model.rs - 模型绑定信息
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use shanan_engine::engine::{Engine, EngineOptions, host::HostRuntime};
use tracing::info;

/// 加载模型并打印每个绑定的形状、元素数与缓冲区大小
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件路径
  #[arg(long, value_name = "FILE")]
  pub model: PathBuf,
  /// 每个元素的字节数
  #[arg(long, value_name = "BYTES", default_value_t = 4)]
  pub element_bytes: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let runtime = HostRuntime::new();
  let device = runtime.host_device();
  let options = EngineOptions {
    element_bytes: args.element_bytes,
  };
  let engine = Engine::load_with_options(Box::new(runtime), &args.model, options)?;

  println!(
    "{:<6} {:<5} {:<24} {:<20} {:>10} {:>12}  步长",
    "方向", "序号", "名称", "形状", "元素数", "大小(KB)"
  );
  for binding in engine.inputs().iter().chain(engine.outputs()) {
    println!(
      "{:<6} {:<5} {:<24} {:<20} {:>10} {:>12.2}  {:?}",
      binding.direction.to_string(),
      binding.index,
      binding.name,
      format!("{:?}", binding.shape),
      binding.element_count,
      binding.byte_size(args.element_bytes) as f64 / 1024.0,
      binding.strides()
    );
  }

  let table = engine.binding_table();
  for (index, address) in table.as_slice().iter().enumerate() {
    println!("绑定表 [{}] = {:#x}", index, address.addr());
  }

  let counters = device.counters();
  info!(
    "设备内存: {} 个分配, 共 {} 字节",
    counters.live_allocations, counters.live_bytes
  );

  engine.shutdown();
  let counters = device.counters();
  info!(
    "关闭后: {} 个分配, 共 {} 字节",
    counters.live_allocations, counters.live_bytes
  );

  Ok(())
}
