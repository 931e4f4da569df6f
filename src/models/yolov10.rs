// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv10 模型实现 (NMS-Free端到端检测)
// 特性: 无需NMS后处理, 直接输出最终检测框

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{Array, Axis, IxDyn};
use tracing::{debug, info};

use super::letterbox;
use crate::{Bbox, DetectionResult, ModelConfig, OrtBackend, YOLOTask};

/// YOLOv10 模型结构
pub struct YOLOv10 {
    engine: OrtBackend,
    nc: usize,
    height: u32,
    width: u32,
    conf: f32,
    names: Vec<String>,
    profile: bool,
}

impl YOLOv10 {
    /// 在已加载的推理引擎上创建 YOLOv10 模型 (只做检测)
    pub fn from_engine(engine: OrtBackend, config: &ModelConfig) -> Result<Self> {
        let (height, width) = (engine.height(), engine.width());
        let nc = engine.nc().unwrap_or(80) as usize;
        let names = engine
            .names()
            .unwrap_or_else(|| (0..nc).map(|i| format!("class{}", i)).collect());

        Ok(Self {
            engine,
            nc,
            height,
            width,
            conf: config.conf,
            names,
            profile: config.profile,
        })
    }
}

/// 端到端输出解码
///
/// 输出格式: [batch, num_boxes, 6], 6 = [x1, y1, x2, y2, confidence, class_id]
/// 已经过模型内部去重, 这里只做置信度过滤与坐标还原
pub(crate) fn decode_end2end(
    preds: &Array<f32, IxDyn>,
    xs0: &[DynamicImage],
    conf: f32,
    nc: usize,
    (width, height): (u32, u32),
) -> Result<Vec<DetectionResult>> {
    if preds.ndim() != 3 || preds.shape()[2] < 6 {
        anyhow::bail!("Unexpected YOLOv10 output shape {:?}", preds.shape());
    }

    let mut ys = Vec::with_capacity(xs0.len());
    for (idx, x0) in xs0.iter().enumerate() {
        let (w0, h0) = x0.dimensions();
        let (w0, h0) = (w0 as f32, h0 as f32);
        let ratio = (width as f32 / w0).min(height as f32 / h0);

        let mut bboxes = Vec::new();
        for pred in preds.index_axis(Axis(0), idx).axis_iter(Axis(0)) {
            let confidence = pred[4];
            if confidence < conf {
                continue;
            }
            let class_id = pred[5] as usize;
            if class_id >= nc {
                continue;
            }

            let x1 = (pred[0] / ratio).clamp(0., w0);
            let y1 = (pred[1] / ratio).clamp(0., h0);
            let x2 = (pred[2] / ratio).clamp(0., w0);
            let y2 = (pred[3] / ratio).clamp(0., h0);
            if x2 <= x1 || y2 <= y1 {
                continue;
            }
            bboxes.push(Bbox::new(x1, y1, x2 - x1, y2 - y1, class_id, confidence));
        }

        ys.push(DetectionResult::new(
            None,
            (!bboxes.is_empty()).then_some(bboxes),
            None,
            None,
        ));
    }
    Ok(ys)
}

impl crate::models::Model for YOLOv10 {
    fn preprocess(&mut self, xs: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
        Ok(vec![letterbox(xs, self.width, self.height)?])
    }

    fn run(&mut self, xs: Vec<Array<f32, IxDyn>>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        let x = xs.into_iter().next().context("Empty input batch")?;
        self.engine.run(x, profile || self.profile)
    }

    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>> {
        let preds = xs.first().context("Model returned no outputs")?;
        let ys = decode_end2end(preds, xs0, self.conf, self.nc, (self.width, self.height))?;
        if self.profile {
            debug!(
                "[YOLOv10 NMS-Free] {} 个目标",
                ys.iter().map(|y| y.num_objects()).sum::<usize>()
            );
        }
        Ok(ys)
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn task(&self) -> YOLOTask {
        YOLOTask::Detect
    }

    fn summary(&self) {
        info!(
            "\nSummary:\n\
            > Model: YOLOv10 (NMS-Free)\n\
            > EP: {:?}\n\
            > Height: {}, Width: {}\n\
            > nc: {}, conf: {}",
            self.engine.ep(),
            self.height,
            self.width,
            self.nc,
            self.conf,
        );
    }
}
