// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/decode.rs - 检测结果解码
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

//! 将模型的四个输出张量（检测数量、边界框、分数、类别）解码为检测结果。
//! 非极大值抑制已在模型内部完成，这里只做置信度过滤。

use std::cmp::Ordering;

use thiserror::Error;
use tracing::{debug, error};

use crate::model::{BoundingBox, DetectedObject};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_MAX_DETECTIONS: usize = 100;

const ELEMENT_BYTES: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("检测数量异常: {count} (允许范围 0-{max})")]
  CorruptDetectionCount { count: i64, max: usize },
  #[error("张量 {tensor} 长度不足: 需要 {required} 个元素, 实际 {actual} 个")]
  TruncatedTensor {
    tensor: &'static str,
    required: usize,
    actual: usize,
  },
  #[error("张量 {tensor} 的字节长度 {len} 不是 {ELEMENT_BYTES} 的整数倍")]
  MisalignedTensor { tensor: &'static str, len: usize },
}

fn require(tensor: &'static str, actual: usize, required: usize) -> Result<(), DecodeError> {
  if actual < required {
    error!("张量 {} 长度不足: 需要 {}, 实际 {}", tensor, required, actual);
    return Err(DecodeError::TruncatedTensor {
      tensor,
      required,
      actual,
    });
  }
  Ok(())
}

/// 按输入顺序输出分数不低于阈值的检测框，框从 (x1, y1, x2, y2) 转为 (x, y, w, h)。
/// 只丢弃分数小于阈值的候选，NaN 分数保留
pub fn decode(
  num_detections: i32,
  bboxes: &[f32],
  scores: &[f32],
  labels: &[i32],
  confidence_threshold: f32,
  max_detections: usize,
) -> Result<Vec<DetectedObject>, DecodeError> {
  let count = usize::try_from(num_detections)
    .ok()
    .filter(|&count| count <= max_detections)
    .ok_or_else(|| {
      error!(
        "检测数量异常 (0-{}): {}, 放弃解码",
        max_detections, num_detections
      );
      DecodeError::CorruptDetectionCount {
        count: i64::from(num_detections),
        max: max_detections,
      }
    })?;

  require("bboxes", bboxes.len(), count * 4)?;
  require("scores", scores.len(), count)?;
  require("labels", labels.len(), count)?;

  let detections: Vec<DetectedObject> = bboxes
    .chunks_exact(4)
    .zip(scores)
    .zip(labels)
    .take(count)
    .filter(|&((_, &score), _)| score.partial_cmp(&confidence_threshold) != Some(Ordering::Less))
    .map(|((bbox, &score), &label)| {
      let (x1, y1, x2, y2) = (bbox[0], bbox[1], bbox[2], bbox[3]);
      DetectedObject {
        rect: BoundingBox {
          x: x1,
          y: y1,
          width: x2 - x1,
          height: y2 - y1,
        },
        class_id: label,
        confidence: score,
      }
    })
    .collect();

  debug!(
    "候选 {} 个, 置信度 >= {} 的检测 {} 个",
    count,
    confidence_threshold,
    detections.len()
  );
  Ok(detections)
}

fn read_elements<T>(
  tensor: &'static str,
  bytes: &[u8],
  from_ne_bytes: fn([u8; ELEMENT_BYTES]) -> T,
) -> Result<Vec<T>, DecodeError> {
  if bytes.len() % ELEMENT_BYTES != 0 {
    return Err(DecodeError::MisalignedTensor {
      tensor,
      len: bytes.len(),
    });
  }
  Ok(
    bytes
      .chunks_exact(ELEMENT_BYTES)
      .map(|chunk| from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
      .collect(),
  )
}

/// 直接从引擎写回的原始字节解码，顺序为 (检测数量, 边界框, 分数, 类别)
pub fn decode_raw(
  outputs: [&[u8]; 4],
  confidence_threshold: f32,
  max_detections: usize,
) -> Result<Vec<DetectedObject>, DecodeError> {
  let [num_dets, bboxes, scores, labels] = outputs;

  let num_dets = read_elements("num_dets", num_dets, i32::from_ne_bytes)?;
  let count = num_dets
    .first()
    .copied()
    .ok_or(DecodeError::TruncatedTensor {
      tensor: "num_dets",
      required: 1,
      actual: 0,
    })?;

  decode(
    count,
    &read_elements("bboxes", bboxes, f32::from_ne_bytes)?,
    &read_elements("scores", scores, f32::from_ne_bytes)?,
    &read_elements("labels", labels, i32::from_ne_bytes)?,
    confidence_threshold,
    max_detections,
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn boxes(n: usize) -> Vec<f32> {
    (0..n)
      .flat_map(|i| {
        let base = i as f32 * 10.0;
        [base, base + 1.0, base + 5.0, base + 9.0]
      })
      .collect()
  }

  #[test]
  fn zero_detections_is_empty() {
    let result = decode(0, &[], &[], &[], 0.25, 100).unwrap();
    assert!(result.is_empty());
  }

  #[test]
  fn filters_by_confidence_and_keeps_order() {
    let scores = [0.1, 0.3, 0.9, 0.2, 0.5];
    let labels = [10, 11, 12, 13, 14];
    let result = decode(5, &boxes(5), &scores, &labels, 0.25, 100).unwrap();

    assert_eq!(result.len(), 3);
    let ids: Vec<i32> = result.iter().map(|d| d.class_id).collect();
    assert_eq!(ids, vec![11, 12, 14]);
    assert_eq!(result[0].confidence, 0.3);
    assert_eq!(
      result[1].rect,
      BoundingBox {
        x: 20.0,
        y: 21.0,
        width: 5.0,
        height: 8.0
      }
    );
  }

  #[test]
  fn score_equal_to_threshold_is_kept() {
    let result = decode(1, &boxes(1), &[0.25], &[0], 0.25, 100).unwrap();
    assert_eq!(result.len(), 1);
  }

  #[test]
  fn nan_score_is_not_discarded() {
    let result = decode(2, &boxes(2), &[f32::NAN, 0.1], &[3, 4], 0.25, 100).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].class_id, 3);
    assert!(result[0].confidence.is_nan());
  }

  #[test]
  fn count_above_maximum_is_corrupt() {
    let err = decode(150, &boxes(150), &[0.5; 150], &[0; 150], 0.25, 100).unwrap_err();
    assert_eq!(
      err,
      DecodeError::CorruptDetectionCount {
        count: 150,
        max: 100
      }
    );
  }

  #[test]
  fn negative_count_is_corrupt() {
    let err = decode(-1, &[], &[], &[], 0.25, 100).unwrap_err();
    assert!(matches!(
      err,
      DecodeError::CorruptDetectionCount { count: -1, .. }
    ));
  }

  #[test]
  fn short_tensor_is_rejected() {
    let err = decode(3, &boxes(2), &[0.5; 3], &[0; 3], 0.25, 100).unwrap_err();
    assert_eq!(
      err,
      DecodeError::TruncatedTensor {
        tensor: "bboxes",
        required: 12,
        actual: 8
      }
    );
  }

  #[test]
  fn decodes_native_endian_bytes() {
    let num = 2i32.to_ne_bytes();
    let bboxes: Vec<u8> = boxes(3).iter().flat_map(|v| v.to_ne_bytes()).collect();
    let scores: Vec<u8> = [0.9f32, 0.1, 0.7].iter().flat_map(|v| v.to_ne_bytes()).collect();
    let labels: Vec<u8> = [1i32, 2, 3].iter().flat_map(|v| v.to_ne_bytes()).collect();

    let outputs = [
      num.as_slice(),
      bboxes.as_slice(),
      scores.as_slice(),
      labels.as_slice(),
    ];
    let result = decode_raw(outputs, 0.25, 3).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].class_id, 1);

    let misaligned = [num.as_slice(), &bboxes[..5], scores.as_slice(), labels.as_slice()];
    let err = decode_raw(misaligned, 0.25, 3).unwrap_err();
    assert!(matches!(err, DecodeError::MisalignedTensor { tensor: "bboxes", .. }));
  }
}
