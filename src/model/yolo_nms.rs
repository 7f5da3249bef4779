// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolo_nms.rs - 内置 NMS 的 YOLO 检测器
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

//! 固定契约的检测器：一个输入张量，四个输出张量
//! `(num_dets, bboxes, scores, labels)`，非极大值抑制在模型内部完成。

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, TryLockError};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  engine::{
    Engine, EngineError, EngineOptions,
    executor::{RetrieveMode, Retrieval},
    host::HostRuntime,
    runtime::Runtime,
  },
  input::AsNchwFrame,
  model::{
    AsyncModel, DetectResult, DetectedObject, Model,
    decode::{DEFAULT_CONFIDENCE_THRESHOLD, DecodeError, decode_raw},
  },
};

const YOLO_NMS_NUM_INPUTS: usize = 1;
const YOLO_NMS_NUM_OUTPUTS: usize = 4;
const YOLO_NMS_ELEMENT_BYTES: usize = 4;

const OUTPUT_INDEX_NUM_DETS: usize = 0;
const OUTPUT_INDEX_BBOXES: usize = 1;
const OUTPUT_INDEX_SCORES: usize = 2;
const OUTPUT_INDEX_LABELS: usize = 3;

/// 每次加载模型时调用，产生新的运行时实例
pub type RuntimeFactory = Box<dyn Fn() -> Box<dyn Runtime> + Send + Sync>;

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("配置错误: {0}")]
  Config(String),
  #[error("模型未加载")]
  NotLoaded,
  #[error("模型不符合检测器契约: {0}")]
  ContractViolation(String),
  #[error("输入图像大小不匹配: 期望 {expected} 个元素, 实际 {actual} 个")]
  InvalidImage { expected: usize, actual: usize },
  #[error("没有已提交的推理")]
  NothingSubmitted,
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("引擎错误: {0}")]
  Engine(#[from] EngineError),
}

impl DetectorError {
  /// 成功时的状态码
  pub const OK: i32 = 0;

  /// 整数状态码，所有错误均为负数
  pub fn status_code(&self) -> i32 {
    match self {
      DetectorError::Config(_) => -1,
      DetectorError::NotLoaded => -2,
      DetectorError::ContractViolation(_) => -3,
      DetectorError::InvalidImage { .. } => -4,
      DetectorError::NothingSubmitted => -5,
      DetectorError::Decode(_) => -6,
      DetectorError::Engine(e) => match e {
        EngineError::ModelRead { .. } => -10,
        EngineError::Runtime(_) => -11,
        EngineError::AlreadyInitialized => -12,
        EngineError::InvalidModelDimension { .. }
        | EngineError::EmptyBindingSet { .. }
        | EngineError::InterleavedBindings { .. }
        | EngineError::MissingBinding { .. } => -13,
        EngineError::AlreadyAllocated | EngineError::InvalidIOCounts { .. } => -14,
        EngineError::DeviceOutOfMemory { .. } => -15,
        EngineError::BufferSizeMismatch { .. } | EngineError::BufferCountMismatch { .. } => -16,
        EngineError::DeviceExecutionFailed { .. } => -17,
        EngineError::AlreadySubmitted => -18,
        EngineError::EngineBusy => -19,
        EngineError::NotReady { .. } => -20,
        EngineError::Poisoned => -21,
      },
    }
  }

  /// 将操作结果折叠为状态码
  pub fn code_of<T>(result: &Result<T, DetectorError>) -> i32 {
    result.as_ref().map_or_else(DetectorError::status_code, |_| Self::OK)
  }
}

pub struct YoloNmsBuilder {
  model_path: PathBuf,
  confidence_threshold: f32,
  element_bytes: usize,
  runtime: Option<RuntimeFactory>,
}

impl FromUrlWithScheme for YoloNmsBuilder {
  const SCHEME: &'static str = "yolo-nms";
}

impl FromUrl for YoloNmsBuilder {
  type Error = DetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DetectorError::Config(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = YoloNmsBuilder::new(url.path());
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "confidence" => {
          builder.confidence_threshold = value
            .parse()
            .map_err(|_| DetectorError::Config(format!("无效的置信度阈值: {}", value)))?;
        }
        "element_bytes" => {
          builder.element_bytes = value
            .parse()
            .map_err(|_| DetectorError::Config(format!("无效的元素宽度: {}", value)))?;
        }
        other => warn!("忽略未知参数: {}={}", other, value),
      }
    }
    Ok(builder)
  }
}

impl YoloNmsBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    YoloNmsBuilder {
      model_path: model_path.into(),
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      element_bytes: YOLO_NMS_ELEMENT_BYTES,
      runtime: None,
    }
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn runtime(mut self, factory: RuntimeFactory) -> Self {
    self.runtime = Some(factory);
    self
  }

  pub fn build<Frame>(self) -> Result<YoloNms<Frame>, DetectorError> {
    let mut detector = match self.runtime {
      Some(factory) => YoloNms::with_runtime(factory),
      None => YoloNms::new(),
    };
    detector.confidence_threshold = self.confidence_threshold;
    detector.element_bytes = self.element_bytes;
    detector.load_model(&self.model_path)?;
    Ok(detector)
  }
}

impl<Frame> FromUrl for YoloNms<Frame> {
  type Error = DetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    YoloNmsBuilder::from_url(url)?.build()
  }
}

struct Staging {
  input: Vec<u8>,
  outputs: [Vec<u8>; YOLO_NMS_NUM_OUTPUTS],
}

struct LoadedDetector {
  staging: Mutex<Staging>,
  max_detections: usize,
  input_elements: usize,
  engine: Engine,
}

pub struct YoloNms<Frame> {
  runtime: RuntimeFactory,
  confidence_threshold: f32,
  element_bytes: usize,
  loaded: Option<LoadedDetector>,
  _phantom: PhantomData<fn(&Frame)>,
}

impl<Frame> Default for YoloNms<Frame> {
  fn default() -> Self {
    Self::new()
  }
}

fn element_count(engine: &Engine, output: usize) -> usize {
  engine.outputs()[output].element_count as usize
}

fn check_contract(engine: &Engine) -> Result<usize, String> {
  if engine.num_inputs() != YOLO_NMS_NUM_INPUTS || engine.num_outputs() != YOLO_NMS_NUM_OUTPUTS {
    return Err(format!(
      "需要 {} 个输入和 {} 个输出, 模型有 {} 个输入和 {} 个输出",
      YOLO_NMS_NUM_INPUTS,
      YOLO_NMS_NUM_OUTPUTS,
      engine.num_inputs(),
      engine.num_outputs()
    ));
  }
  if engine.options().element_bytes != YOLO_NMS_ELEMENT_BYTES {
    return Err(format!(
      "元素宽度必须为 {} 字节, 实际为 {}",
      YOLO_NMS_ELEMENT_BYTES,
      engine.options().element_bytes
    ));
  }

  let max_detections = element_count(engine, OUTPUT_INDEX_SCORES);
  let num_dets = element_count(engine, OUTPUT_INDEX_NUM_DETS);
  let bboxes = element_count(engine, OUTPUT_INDEX_BBOXES);
  let labels = element_count(engine, OUTPUT_INDEX_LABELS);
  if num_dets < 1 {
    return Err("检测数量张量为空".to_string());
  }
  if bboxes != max_detections * 4 {
    return Err(format!(
      "边界框张量应有 {} 个元素, 实际为 {}",
      max_detections * 4,
      bboxes
    ));
  }
  if labels != max_detections {
    return Err(format!(
      "类别张量应有 {} 个元素, 实际为 {}",
      max_detections, labels
    ));
  }
  Ok(max_detections)
}

impl<Frame> YoloNms<Frame> {
  /// 使用主机内存运行时
  pub fn new() -> Self {
    Self::with_runtime(Box::new(|| Box::new(HostRuntime::new())))
  }

  pub fn with_runtime(runtime: RuntimeFactory) -> Self {
    YoloNms {
      runtime,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      element_bytes: YOLO_NMS_ELEMENT_BYTES,
      loaded: None,
      _phantom: PhantomData,
    }
  }

  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }

  pub fn set_confidence_threshold(&mut self, threshold: f32) {
    self.confidence_threshold = threshold;
  }

  pub fn is_loaded(&self) -> bool {
    self.loaded.is_some()
  }

  pub fn max_detections(&self) -> Option<usize> {
    self.loaded.as_ref().map(|loaded| loaded.max_detections)
  }

  pub fn engine(&self) -> Option<&Engine> {
    self.loaded.as_ref().map(|loaded| &loaded.engine)
  }

  pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<(), DetectorError> {
    if self.loaded.is_some() {
      error!("检测器已初始化, 加载被中止");
      return Err(EngineError::AlreadyInitialized.into());
    }

    let options = EngineOptions {
      element_bytes: self.element_bytes,
    };
    let engine = Engine::load_with_options((self.runtime)(), path, options)?;
    let max_detections = check_contract(&engine).map_err(|reason| {
      error!("模型不符合检测器契约: {}", reason);
      DetectorError::ContractViolation(reason)
    })?;

    let input_elements = engine.inputs()[0].element_count as usize;
    let staging = Staging {
      input: vec![0u8; input_elements * YOLO_NMS_ELEMENT_BYTES],
      outputs: std::array::from_fn(|i| {
        vec![0u8; element_count(&engine, i) * YOLO_NMS_ELEMENT_BYTES]
      }),
    };
    info!(
      "检测器就绪: 输入 {} 个元素, 最多 {} 个检测",
      input_elements, max_detections
    );

    self.loaded = Some(LoadedDetector {
      staging: Mutex::new(staging),
      max_detections,
      input_elements,
      engine,
    });
    Ok(())
  }

  fn loaded(&self) -> Result<&LoadedDetector, DetectorError> {
    self.loaded.as_ref().ok_or_else(|| {
      error!("检测器未初始化");
      DetectorError::NotLoaded
    })
  }

  fn with_staging<T>(
    &self,
    f: impl FnOnce(&LoadedDetector, &mut Staging) -> Result<T, DetectorError>,
  ) -> Result<T, DetectorError> {
    let loaded = self.loaded()?;
    let mut staging = match loaded.staging.try_lock() {
      Ok(guard) => guard,
      Err(TryLockError::WouldBlock) => return Err(EngineError::EngineBusy.into()),
      Err(TryLockError::Poisoned(_)) => return Err(EngineError::Poisoned.into()),
    };
    f(loaded, &mut staging)
  }

  fn stage_input(
    loaded: &LoadedDetector,
    staging: &mut Staging,
    image: &[f32],
  ) -> Result<(), DetectorError> {
    if image.len() != loaded.input_elements {
      error!(
        "输入图像大小不匹配: 期望 {} 个元素, 实际 {} 个",
        loaded.input_elements,
        image.len()
      );
      return Err(DetectorError::InvalidImage {
        expected: loaded.input_elements,
        actual: image.len(),
      });
    }
    for (chunk, value) in staging.input.chunks_exact_mut(YOLO_NMS_ELEMENT_BYTES).zip(image) {
      chunk.copy_from_slice(&value.to_ne_bytes());
    }
    Ok(())
  }

  fn decode(
    &self,
    loaded: &LoadedDetector,
    staging: &Staging,
  ) -> Result<Vec<DetectedObject>, DetectorError> {
    let [num_dets, bboxes, scores, labels] = &staging.outputs;
    let detections = decode_raw(
      [
        num_dets.as_slice(),
        bboxes.as_slice(),
        scores.as_slice(),
        labels.as_slice(),
      ],
      self.confidence_threshold,
      loaded.max_detections,
    )?;
    debug!("检测到 {} 个物体", detections.len());
    Ok(detections)
  }

  /// 同步检测，`image` 为归一化后的 NCHW 浮点数据
  pub fn detect_objects(&self, image: &[f32]) -> Result<Vec<DetectedObject>, DetectorError> {
    self.with_staging(|loaded, staging| {
      Self::stage_input(loaded, staging, image)?;
      {
        let Staging { input, outputs } = &mut *staging;
        let mut outputs: Vec<&mut [u8]> = outputs.iter_mut().map(Vec::as_mut_slice).collect();
        loaded.engine.infer(&[input.as_slice()], &mut outputs)?;
      }
      self.decode(loaded, staging)
    })
  }

  pub fn submit_image(&self, image: &[f32]) -> Result<(), DetectorError> {
    self.with_staging(|loaded, staging| {
      Self::stage_input(loaded, staging, image)?;
      loaded.engine.submit(&[staging.input.as_slice()])?;
      Ok(())
    })
  }

  /// 结果未就绪时返回 `Ok(None)`
  pub fn retrieve_objects(
    &self,
    mode: RetrieveMode,
  ) -> Result<Option<Vec<DetectedObject>>, DetectorError> {
    self.with_staging(|loaded, staging| {
      let retrieval = {
        let mut outputs: Vec<&mut [u8]> =
          staging.outputs.iter_mut().map(Vec::as_mut_slice).collect();
        loaded.engine.retrieve(&mut outputs, mode)?
      };
      match retrieval {
        Retrieval::Complete { .. } => self.decode(loaded, staging).map(Some),
        Retrieval::Pending => Ok(None),
        Retrieval::Nothing => Err(DetectorError::NothingSubmitted),
      }
    })
  }

  /// 释放引擎及全部缓冲区，可重复调用，之后可以重新加载
  pub fn unload_model(&mut self) {
    if let Some(loaded) = self.loaded.take() {
      loaded.engine.shutdown();
      info!("检测器已卸载");
    }
  }
}

impl<Frame: AsNchwFrame> Model for YoloNms<Frame> {
  type Input = Frame;
  type Output = DetectResult;
  type Error = DetectorError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.detect_objects(&input.to_tensor()).map(DetectResult::from)
  }
}

impl<Frame: AsNchwFrame> AsyncModel for YoloNms<Frame> {
  fn submit(&self, input: &Self::Input) -> Result<(), Self::Error> {
    self.submit_image(&input.to_tensor())
  }

  fn retrieve(&self, mode: RetrieveMode) -> Result<Option<Self::Output>, Self::Error> {
    Ok(self.retrieve_objects(mode)?.map(DetectResult::from))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_reads_query() {
    let url = Url::parse("yolo-nms:///models/det.json?confidence=0.5&element_bytes=4").unwrap();
    let builder = YoloNmsBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/models/det.json"));
    assert_eq!(builder.confidence_threshold, 0.5);
    assert_eq!(builder.element_bytes, 4);
  }

  #[test]
  fn builder_rejects_other_scheme() {
    let url = Url::parse("yolo26:///models/det.rknn").unwrap();
    assert!(matches!(
      YoloNmsBuilder::from_url(&url),
      Err(DetectorError::Config(_))
    ));
  }

  #[test]
  fn status_codes_are_negative_and_distinct() {
    let errors = [
      DetectorError::Config(String::new()),
      DetectorError::NotLoaded,
      DetectorError::ContractViolation(String::new()),
      DetectorError::InvalidImage {
        expected: 1,
        actual: 2,
      },
      DetectorError::NothingSubmitted,
      DetectorError::Engine(EngineError::AlreadyInitialized),
      DetectorError::Engine(EngineError::EngineBusy),
    ];
    let mut codes: Vec<i32> = errors.iter().map(DetectorError::status_code).collect();
    assert!(codes.iter().all(|&code| code < 0));
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), errors.len());

    assert_eq!(DetectorError::code_of(&Ok::<(), DetectorError>(())), 0);
    assert_eq!(
      DetectorError::code_of::<()>(&Err(DetectorError::NotLoaded)),
      -2
    );
  }

  #[test]
  fn detect_without_model_fails() {
    let detector: YoloNms<()> = YoloNms::new();
    let err = detector.detect_objects(&[0.0; 4]).unwrap_err();
    assert!(matches!(err, DetectorError::NotLoaded));
  }
}
