// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/output.rs - 输出集成测试
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

#![cfg(feature = "directory_record")]

use std::path::{Path, PathBuf};

use shanan_engine::{
  FromUrl,
  frame::RgbNchwFrame,
  model::{BoundingBox, CocoLabel, DetectResult, DetectedObject},
  output::{DirectoryRecordOutput, OutputError, OutputWrapper, Render},
};
use url::Url;

type Frame = RgbNchwFrame<4, 4>;

fn files_with_extension(root: &Path, extension: &str) -> Vec<PathBuf> {
  let mut found = Vec::new();
  for entry in std::fs::read_dir(root).unwrap() {
    let path = entry.unwrap().path();
    if path.is_dir() {
      found.extend(files_with_extension(&path, extension));
    } else if path.extension().is_some_and(|e| e == extension) {
      found.push(path);
    }
  }
  found
}

fn person() -> DetectResult {
  DetectResult::from(vec![DetectedObject {
    rect: BoundingBox {
      x: 1.0,
      y: 2.0,
      width: 3.0,
      height: 4.0,
    },
    class_id: 0,
    confidence: 0.75,
  }])
}

#[test]
fn empty_results_are_skipped_unless_always() {
  let dir = tempfile::tempdir().unwrap();
  let output: DirectoryRecordOutput<4, 4, CocoLabel> = DirectoryRecordOutput::new(dir.path());
  output
    .render_result(&Frame::default(), &DetectResult::default())
    .unwrap();
  assert_eq!(output.frame_count(), 0);
  assert!(files_with_extension(dir.path(), "json").is_empty());

  let output = output.always(true);
  output
    .render_result(&Frame::default(), &DetectResult::default())
    .unwrap();
  assert_eq!(output.frame_count(), 1);
  assert_eq!(files_with_extension(dir.path(), "json").len(), 1);
}

#[test]
fn records_detections_as_json_with_image() {
  let dir = tempfile::tempdir().unwrap();
  let url = Url::parse(&format!("folder://{}?image", dir.path().display())).unwrap();
  let output: OutputWrapper<4, 4> = OutputWrapper::from_url(&url).unwrap();

  output.render_result(&Frame::default(), &person()).unwrap();

  let records = files_with_extension(dir.path(), "json");
  assert_eq!(records.len(), 1);
  let record: serde_json::Value =
    serde_json::from_slice(&std::fs::read(&records[0]).unwrap()).unwrap();
  assert_eq!(record["frame"], 1);
  assert_eq!(record["detections"][0]["label"], "person");
  assert_eq!(record["detections"][0]["class_id"], 0);
  assert_eq!(record["detections"][0]["rect"]["width"], 3.0);
  assert_eq!(files_with_extension(dir.path(), "png").len(), 1);
}

#[test]
fn unknown_scheme_is_rejected() {
  let url = Url::parse("rtsp://localhost/stream").unwrap();
  assert!(matches!(
    OutputWrapper::<4, 4>::from_url(&url),
    Err(OutputError::SchemeMismatch(_))
  ));
}
