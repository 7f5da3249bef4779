// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/engine.rs - 推理引擎集成测试
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

use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use shanan_engine::engine::{
  Engine, EngineError, EngineOptions, EngineState,
  introspect::BindingDirection,
  runtime::Device,
  executor::{AsyncState, ExecutionStage, RetrieveMode, Retrieval},
  host::{
    HostBindingSpec, HostDevice, HostKernel, HostKernelSpec, HostModelSpec, HostRuntime,
    HostTensor,
  },
};

const INPUT_BYTES: usize = 48;
const OUTPUT_BYTES: [usize; 4] = [4, 48, 12, 12];

fn bindings() -> Vec<HostBindingSpec> {
  vec![
    HostBindingSpec::input("images", &[1, 3, 2, 2]),
    HostBindingSpec::output("num_dets", &[1, 1]),
    HostBindingSpec::output("bboxes", &[1, 3, 4]),
    HostBindingSpec::output("scores", &[1, 3]),
    HostBindingSpec::output("labels", &[1, 3]),
  ]
}

fn replay_tensors() -> Vec<HostTensor> {
  vec![
    HostTensor::I32(vec![2]),
    HostTensor::F32((0..12).map(|v| v as f32).collect()),
    HostTensor::F32(vec![0.9, 0.1, 0.6]),
    HostTensor::I32(vec![0, 1, 2]),
  ]
}

fn replay_blob() -> Vec<u8> {
  HostModelSpec::new(bindings())
    .with_kernel(HostKernelSpec::Replay {
      outputs: replay_tensors(),
    })
    .to_blob()
    .unwrap()
}

fn load(runtime: HostRuntime) -> Engine {
  Engine::from_blob(Box::new(runtime), &replay_blob(), EngineOptions::default()).unwrap()
}

fn output_buffers(fill: u8) -> Vec<Vec<u8>> {
  OUTPUT_BYTES.iter().map(|&len| vec![fill; len]).collect()
}

fn as_mut_slices(buffers: &mut [Vec<u8>]) -> Vec<&mut [u8]> {
  buffers.iter_mut().map(Vec::as_mut_slice).collect()
}

/// 计算核在收到放行信号之前一直阻塞，进入时发出通知
struct GatedKernel {
  gate: Mutex<mpsc::Receiver<()>>,
  entered: Mutex<mpsc::Sender<()>>,
}

impl HostKernel for GatedKernel {
  fn run(&self, _inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), String> {
    if let Ok(entered) = self.entered.lock() {
      let _ = entered.send(());
    }
    self
      .gate
      .lock()
      .map_err(|e| e.to_string())?
      .recv()
      .map_err(|e| e.to_string())?;
    for output in outputs.iter_mut() {
      output.fill(7);
    }
    Ok(())
  }
}

fn gated() -> (HostRuntime, mpsc::Sender<()>) {
  let (runtime, gate, _entered) = gated_with_entry();
  (runtime, gate)
}

fn gated_with_entry() -> (HostRuntime, mpsc::Sender<()>, mpsc::Receiver<()>) {
  let (gate_tx, gate_rx) = mpsc::channel();
  let (entered_tx, entered_rx) = mpsc::channel();
  let runtime = HostRuntime::new().with_kernel(Arc::new(GatedKernel {
    gate: Mutex::new(gate_rx),
    entered: Mutex::new(entered_tx),
  }));
  (runtime, gate_tx, entered_rx)
}

struct FailingKernel;

impl HostKernel for FailingKernel {
  fn run(&self, _inputs: &[&[u8]], _outputs: &mut [&mut [u8]]) -> Result<(), String> {
    Err("计算核故障".to_string())
  }
}

#[test]
fn metadata_matches_declared_shapes() {
  let engine = load(HostRuntime::new());
  assert_eq!(engine.state(), EngineState::Ready);
  assert_eq!(engine.num_inputs(), 1);
  assert_eq!(engine.num_outputs(), 4);
  assert_eq!(engine.input_element_counts(), vec![12]);
  assert_eq!(engine.output_element_counts(), vec![1, 12, 3, 3]);
  assert_eq!(engine.input_size_bytes(), vec![INPUT_BYTES]);
  assert_eq!(engine.output_size_bytes(), OUTPUT_BYTES.to_vec());
  assert_eq!(engine.output_shapes()[1], &[1, 3, 4]);
  assert_eq!(engine.binding_table().len(), 5);
  assert_eq!(engine.binding_table().num_inputs(), 1);
}

#[test]
fn sync_inference_replays_outputs() {
  let engine = load(HostRuntime::new());
  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);
  engine
    .infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs))
    .unwrap();

  let expected: Vec<Vec<u8>> = replay_tensors().iter().map(HostTensor::to_bytes).collect();
  assert_eq!(outputs, expected);
}

#[test]
fn size_mismatch_touches_no_device_memory() {
  let runtime = HostRuntime::new();
  let device = runtime.host_device();
  let engine = load(runtime);

  let short_input = vec![0u8; INPUT_BYTES - 1];
  let mut outputs = output_buffers(0xAB);
  let err = engine
    .infer(&[short_input.as_slice()], &mut as_mut_slices(&mut outputs))
    .unwrap_err();
  assert!(matches!(
    err,
    EngineError::BufferSizeMismatch {
      index: 0,
      expected: INPUT_BYTES,
      actual,
      ..
    } if actual == INPUT_BYTES - 1
  ));

  let input = vec![0u8; INPUT_BYTES];
  let mut outputs_long = output_buffers(0xAB);
  outputs_long[2].push(0xAB);
  let err = engine
    .infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs_long))
    .unwrap_err();
  assert!(matches!(err, EngineError::BufferSizeMismatch { index: 2, .. }));

  let counters = device.counters();
  assert_eq!(counters.copies_to_device, 0);
  assert_eq!(counters.copies_to_host, 0);
  assert_eq!(counters.executions, 0);
  assert!(outputs.iter().flatten().all(|&b| b == 0xAB));
}

#[test]
fn buffer_count_mismatch_is_rejected() {
  let engine = load(HostRuntime::new());
  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);
  let mut slices = as_mut_slices(&mut outputs);
  slices.pop();
  let err = engine.infer(&[input.as_slice()], &mut slices).unwrap_err();
  assert!(matches!(
    err,
    EngineError::BufferCountMismatch {
      expected_outputs: 4,
      actual_outputs: 3,
      ..
    }
  ));
}

#[test]
fn failed_allocation_leaves_nothing_behind() {
  let device = Arc::new(HostDevice::with_capacity(INPUT_BYTES + 4 + 48));
  let runtime = HostRuntime::with_device(device.clone());
  let err = Engine::from_blob(Box::new(runtime), &replay_blob(), EngineOptions::default())
    .unwrap_err();
  assert!(matches!(
    err,
    EngineError::DeviceOutOfMemory { ref binding, bytes: 12, .. } if binding == "scores"
  ));
  assert_eq!(device.counters().live_allocations, 0);
}

#[test]
fn sizes_are_checked_before_counts() {
  let engine = load(HostRuntime::new());
  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);
  outputs[1].pop();
  let err = engine
    .infer(
      &[input.as_slice(), input.as_slice()],
      &mut as_mut_slices(&mut outputs),
    )
    .unwrap_err();
  assert!(matches!(
    err,
    EngineError::BufferSizeMismatch {
      direction: BindingDirection::Output,
      index: 1,
      ..
    }
  ));
}

#[test]
fn oversized_model_reports_out_of_memory() {
  for extent in [1i64 << 38, 1i64 << 62] {
    let runtime = HostRuntime::new();
    let device = runtime.host_device();
    let blob = HostModelSpec::new(vec![
      HostBindingSpec::input("images", &[extent]),
      HostBindingSpec::output("scores", &[1, 3]),
    ])
    .to_blob()
    .unwrap();

    let err =
      Engine::from_blob(Box::new(runtime), &blob, EngineOptions::default()).unwrap_err();
    assert!(matches!(
      err,
      EngineError::DeviceOutOfMemory { ref binding, .. } if binding == "images"
    ));
    assert_eq!(device.counters().live_allocations, 0);
  }
}

#[test]
fn allocation_can_be_retried_after_out_of_memory() {
  let device = Arc::new(HostDevice::with_capacity(INPUT_BYTES + 76));
  let runtime = HostRuntime::with_device(device.clone());
  let engine = Engine::prepare(Box::new(runtime), &replay_blob(), EngineOptions::default())
    .unwrap();
  assert_eq!(engine.state(), EngineState::Loaded);
  assert!(engine.binding_table().is_empty());

  let blocker = device.alloc(16).unwrap();
  assert!(matches!(
    engine.allocate().unwrap_err(),
    EngineError::DeviceOutOfMemory { .. }
  ));
  assert_eq!(engine.state(), EngineState::Loaded);
  assert_eq!(device.counters().live_allocations, 1);

  device.free(blocker).unwrap();
  engine.allocate().unwrap();
  assert_eq!(engine.state(), EngineState::Ready);
  assert_eq!(device.counters().live_allocations, 5);

  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);
  engine
    .infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs))
    .unwrap();
}

#[test]
fn device_failures_name_the_stage() {
  let runtime = HostRuntime::new().with_kernel(Arc::new(FailingKernel));
  let engine = load(runtime);
  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);

  let err = engine
    .infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs))
    .unwrap_err();
  assert!(matches!(
    err,
    EngineError::DeviceExecutionFailed {
      stage: ExecutionStage::Execute,
      ..
    }
  ));

  engine.submit(&[input.as_slice()]).unwrap();
  let err = engine
    .retrieve(&mut as_mut_slices(&mut outputs), RetrieveMode::Blocking)
    .unwrap_err();
  assert!(matches!(
    err,
    EngineError::DeviceExecutionFailed {
      stage: ExecutionStage::Completion,
      ..
    }
  ));
  assert_eq!(engine.async_state(), AsyncState::Idle);
  assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn concurrent_sync_inference_is_busy() {
  let (runtime, gate, entered) = gated_with_entry();
  let engine = Arc::new(load(runtime));

  let worker = {
    let engine = engine.clone();
    thread::spawn(move || {
      let input = vec![0u8; INPUT_BYTES];
      let mut outputs = output_buffers(0);
      engine.infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs))
    })
  };
  entered.recv().unwrap();

  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);
  let err = engine
    .infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs))
    .unwrap_err();
  assert!(matches!(err, EngineError::EngineBusy));

  gate.send(()).unwrap();
  worker.join().unwrap().unwrap();
  assert_eq!(engine.async_state(), AsyncState::Idle);
}

#[test]
fn poll_returns_pending_until_device_finishes() {
  let (runtime, gate) = gated();
  let engine = load(runtime);
  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);

  engine.submit(&[input.as_slice()]).unwrap();
  assert_eq!(engine.async_state(), AsyncState::Submitted);
  assert_eq!(
    engine
      .retrieve(&mut as_mut_slices(&mut outputs), RetrieveMode::Poll)
      .unwrap(),
    Retrieval::Pending
  );
  assert_eq!(
    engine
      .retrieve(
        &mut as_mut_slices(&mut outputs),
        RetrieveMode::Timeout(std::time::Duration::from_millis(10))
      )
      .unwrap(),
    Retrieval::Pending
  );

  gate.send(()).unwrap();
  let retrieval = engine
    .retrieve(&mut as_mut_slices(&mut outputs), RetrieveMode::Blocking)
    .unwrap();
  assert_eq!(
    retrieval,
    Retrieval::Complete {
      bytes: OUTPUT_BYTES.iter().sum()
    }
  );
  assert!(outputs.iter().flatten().all(|&b| b == 7));
  assert_eq!(engine.async_state(), AsyncState::Idle);
}

#[test]
fn sync_inference_during_submission_is_busy() {
  let (runtime, gate) = gated();
  let engine = load(runtime);
  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);

  engine.submit(&[input.as_slice()]).unwrap();
  let err = engine
    .infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs))
    .unwrap_err();
  assert!(matches!(err, EngineError::EngineBusy));
  assert!(matches!(
    engine.submit(&[input.as_slice()]).unwrap_err(),
    EngineError::AlreadySubmitted
  ));
  assert!(matches!(
    engine.deallocate().unwrap_err(),
    EngineError::EngineBusy
  ));

  gate.send(()).unwrap();
  engine
    .retrieve(&mut as_mut_slices(&mut outputs), RetrieveMode::Blocking)
    .unwrap();
}

#[test]
fn retrieve_while_idle_returns_nothing() {
  let engine = load(HostRuntime::new());
  let mut outputs = output_buffers(0);
  let retrieval = engine
    .retrieve(&mut as_mut_slices(&mut outputs), RetrieveMode::Blocking)
    .unwrap();
  assert_eq!(retrieval, Retrieval::Nothing);
  assert_eq!(engine.async_state(), AsyncState::Failed);

  // 失败状态下可以重新提交
  let input = vec![0u8; INPUT_BYTES];
  engine.submit(&[input.as_slice()]).unwrap();
  let retrieval = engine
    .retrieve(&mut as_mut_slices(&mut outputs), RetrieveMode::Blocking)
    .unwrap();
  assert!(matches!(retrieval, Retrieval::Complete { .. }));
}

#[test]
fn deallocate_and_allocate_cycle() {
  let runtime = HostRuntime::new();
  let device = runtime.host_device();
  let engine = load(runtime);
  assert_eq!(device.counters().live_allocations, 5);

  engine.deallocate().unwrap();
  engine.deallocate().unwrap();
  assert_eq!(engine.state(), EngineState::Deallocated);
  assert_eq!(device.counters().live_allocations, 0);
  assert!(engine.binding_table().is_empty());

  let input = vec![0u8; INPUT_BYTES];
  let mut outputs = output_buffers(0);
  assert!(matches!(
    engine.infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs)),
    Err(EngineError::NotReady {
      state: EngineState::Deallocated
    })
  ));

  engine.allocate().unwrap();
  assert_eq!(engine.state(), EngineState::Ready);
  assert_eq!(device.counters().live_allocations, 5);
  assert!(matches!(
    engine.allocate().unwrap_err(),
    EngineError::AlreadyAllocated
  ));
  engine
    .infer(&[input.as_slice()], &mut as_mut_slices(&mut outputs))
    .unwrap();
}

#[test]
fn shutdown_is_idempotent() {
  let runtime = HostRuntime::new();
  let device = runtime.host_device();
  let engine = load(runtime);

  engine.shutdown();
  engine.unload();
  assert_eq!(engine.state(), EngineState::ShutDown);
  assert_eq!(device.counters().live_allocations, 0);
  assert!(matches!(
    engine.allocate().unwrap_err(),
    EngineError::NotReady {
      state: EngineState::ShutDown
    }
  ));
}

#[test]
fn drop_waits_for_outstanding_submission() {
  let (runtime, gate) = gated();
  let device = runtime.host_device();
  let engine = load(runtime);
  engine.submit(&[vec![0u8; INPUT_BYTES].as_slice()]).unwrap();

  let releaser = thread::spawn(move || {
    thread::sleep(std::time::Duration::from_millis(20));
    gate.send(()).unwrap();
  });
  drop(engine);
  releaser.join().unwrap();

  let counters = device.counters();
  assert_eq!(counters.executions, 1);
  assert_eq!(counters.live_allocations, 0);
}

#[test]
fn metadata_is_readable_across_threads() {
  let engine = Arc::new(load(HostRuntime::new()));
  let handles: Vec<_> = (0..4)
    .map(|_| {
      let engine = engine.clone();
      thread::spawn(move || {
        (0..100)
          .map(|_| engine.output_size_bytes().iter().sum::<usize>())
          .all(|total| total == OUTPUT_BYTES.iter().sum::<usize>())
      })
    })
    .collect();
  for handle in handles {
    assert!(handle.join().unwrap());
  }
}

#[test]
fn missing_model_file_is_reported() {
  let err = Engine::load(Box::new(HostRuntime::new()), "/nonexistent/model.json").unwrap_err();
  assert!(matches!(err, EngineError::ModelRead { .. }));
}
