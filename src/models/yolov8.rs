// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 完整模型实现
// 包含: 模型加载、预处理、推理、后处理

use anyhow::{Context, Result};
use image::{imageops, DynamicImage, GenericImageView, GrayImage, Luma};
use ndarray::{s, Array, ArrayView3, Axis, IxDyn};
use tracing::info;

use super::{letterbox, scale_wh};
use crate::{
    non_max_suppression, Bbox, DetectionResult, Embedding, ModelConfig, OrtBackend, Point2,
    YOLOTask,
};

const CXYWH_OFFSET: usize = 4;
const KPT_STEP: usize = 3;

/// YOLOv8 后处理配置
#[derive(Debug, Clone)]
pub struct YOLOv8Config {
    pub task: YOLOTask,
    pub nc: usize,
    pub nk: usize,
    pub nm: usize,
    pub conf: f32,
    pub kconf: f32,
    pub iou: f32,
    pub width: u32,
    pub height: u32,
}

/// YOLOv8 后处理器: 原始输出 → 检测结果 (不依赖推理引擎)
#[derive(Debug, Clone)]
pub struct YOLOv8Postprocessor {
    config: YOLOv8Config,
}

/// YOLOv8 完整模型结构
pub struct YOLOv8 {
    engine: OrtBackend,
    post: YOLOv8Postprocessor,
    names: Vec<String>,
    profile: bool,
}

impl YOLOv8 {
    /// 在已加载的推理引擎上创建 YOLOv8 模型
    pub fn from_engine(engine: OrtBackend, config: &ModelConfig) -> Result<Self> {
        let (height, width, task) = (engine.height(), engine.width(), engine.task());

        // 元数据缺失时退回 COCO 80 类
        let nc = engine.nc().unwrap_or(80) as usize;
        let nk = match task {
            YOLOTask::Pose => engine.nk().unwrap_or(17) as usize,
            _ => 0,
        };
        let nm = match task {
            YOLOTask::Segment => 32,
            _ => 0,
        };
        if task == YOLOTask::Segment && engine.num_outputs() < 2 {
            anyhow::bail!("Segment model must output mask prototypes");
        }

        let names = engine
            .names()
            .unwrap_or_else(|| (0..nc).map(|i| format!("class{}", i)).collect());

        let post = YOLOv8Postprocessor::new(YOLOv8Config {
            task,
            nc,
            nk,
            nm,
            conf: config.conf,
            kconf: config.kconf,
            iou: config.iou,
            width,
            height,
        });

        Ok(Self {
            engine,
            post,
            names,
            profile: config.profile,
        })
    }

    pub fn preprocess(&mut self, xs: &[DynamicImage]) -> Result<Array<f32, IxDyn>> {
        let (width, height) = (self.width(), self.height());
        if let YOLOTask::Classify = self.post.config.task {
            // 分类模型直接拉伸到输入尺寸
            let mut ys = Array::zeros((xs.len(), 3, height as usize, width as usize)).into_dyn();
            for (idx, x) in xs.iter().enumerate() {
                let img = x
                    .resize_exact(width, height, imageops::FilterType::Triangle)
                    .to_rgb8();
                for (x, y, rgb) in img.enumerate_pixels() {
                    let [r, g, b] = rgb.0;
                    ys[[idx, 0, y as usize, x as usize]] = r as f32 / 255.0;
                    ys[[idx, 1, y as usize, x as usize]] = g as f32 / 255.0;
                    ys[[idx, 2, y as usize, x as usize]] = b as f32 / 255.0;
                }
            }
            return Ok(ys);
        }
        letterbox(xs, width, height)
    }

    pub fn summary(&self) {
        let c = &self.post.config;
        info!(
            "\nSummary:\n\
            > Task: {:?}{}\n\
            > EP: {:?}\n\
            > Batch: {}, Height: {}, Width: {}\n\
            > nc: {} nk: {}, nm: {}, conf: {}, kconf: {}, iou: {}",
            c.task,
            match self.engine.author().zip(self.engine.version()) {
                Some((author, ver)) => format!(" ({} {})", author, ver),
                None => String::from(""),
            },
            self.engine.ep(),
            self.engine.batch(),
            c.height,
            c.width,
            c.nc,
            c.nk,
            c.nm,
            c.conf,
            c.kconf,
            c.iou,
        );
    }

    pub fn width(&self) -> u32 {
        self.post.config.width
    }

    pub fn height(&self) -> u32 {
        self.post.config.height
    }
}

impl YOLOv8Postprocessor {
    pub fn new(config: YOLOv8Config) -> Self {
        Self { config }
    }

    pub fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>> {
        let preds = xs.first().context("Model returned no outputs")?;

        if let YOLOTask::Classify = self.config.task {
            return Ok(preds
                .axis_iter(Axis(0))
                .map(|batch| {
                    DetectionResult::new(Some(Embedding::new(batch.into_owned())), None, None, None)
                })
                .collect());
        }

        if preds.ndim() != 3 {
            anyhow::bail!("Unexpected output shape {:?}", preds.shape());
        }
        let protos = xs.get(1);
        // 每个 anchor: cxcywh + 类别分数 + 关键点 + 掩膜系数
        let need = CXYWH_OFFSET + self.config.nc + KPT_STEP * self.config.nk + self.config.nm;

        let mut ys = Vec::new();
        for (idx, anchor) in preds.axis_iter(Axis(0)).enumerate() {
            let x0 = xs0.get(idx).context("Fewer images than model outputs")?;
            let width_original = x0.width() as f32;
            let height_original = x0.height() as f32;
            let ratio = (self.config.width as f32 / width_original)
                .min(self.config.height as f32 / height_original);

            let mut data: Vec<(Bbox, Option<Vec<Point2>>, Option<Vec<f32>>)> = Vec::new();
            // anchor: [4 + nc + extra, num_anchors]
            for pred in anchor.axis_iter(Axis(1)) {
                if pred.len() < need {
                    anyhow::bail!(
                        "Prediction length {} too short for nc {} nk {} nm {}",
                        pred.len(),
                        self.config.nc,
                        self.config.nk,
                        self.config.nm
                    );
                }
                let bbox = pred.slice(s![0..CXYWH_OFFSET]);
                let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + self.config.nc]);

                let Some((id, &confidence)) = clss
                    .into_iter()
                    .enumerate()
                    .reduce(|max, x| if x.1 > max.1 { x } else { max })
                else {
                    continue;
                };

                if confidence < self.config.conf {
                    continue;
                }

                let cx = bbox[0] / ratio;
                let cy = bbox[1] / ratio;
                let w = bbox[2] / ratio;
                let h = bbox[3] / ratio;
                let x = (cx - w / 2.).clamp(0., width_original);
                let y = (cy - h / 2.).clamp(0., height_original);
                let y_bbox = Bbox::new(
                    x,
                    y,
                    w.min(width_original - x),
                    h.min(height_original - y),
                    id,
                    confidence,
                );

                let y_kpts = if let YOLOTask::Pose = self.config.task {
                    let kpts = pred.slice(s![pred.len() - KPT_STEP * self.config.nk..]);
                    let mut kpts_ = Vec::with_capacity(self.config.nk);
                    for i in 0..self.config.nk {
                        let kx = kpts[KPT_STEP * i] / ratio;
                        let ky = kpts[KPT_STEP * i + 1] / ratio;
                        let kconf = kpts[KPT_STEP * i + 2];
                        if kconf < self.config.kconf {
                            kpts_.push(Point2::default());
                        } else {
                            kpts_.push(Point2::new_with_conf(
                                kx.clamp(0., width_original),
                                ky.clamp(0., height_original),
                                kconf,
                            ));
                        }
                    }
                    Some(kpts_)
                } else {
                    None
                };

                let coefs = if let YOLOTask::Segment = self.config.task {
                    Some(pred.slice(s![pred.len() - self.config.nm..]).to_vec())
                } else {
                    None
                };

                data.push((y_bbox, y_kpts, coefs));
            }

            non_max_suppression(&mut data, self.config.iou);

            let mut y_bboxes: Vec<Bbox> = Vec::new();
            let mut y_kpts: Vec<Vec<Point2>> = Vec::new();
            let mut y_masks: Vec<Vec<u8>> = Vec::new();
            for (bbox, kpts, coefs) in data.into_iter() {
                if let Some(kpts) = kpts {
                    y_kpts.push(kpts);
                }
                if let Some(coefs) = coefs {
                    let protos = protos.context("Missing mask prototypes")?;
                    let proto = protos.slice(s![idx, .., .., ..]);
                    let proto = proto
                        .into_dimensionality::<ndarray::Ix3>()
                        .context("Unexpected prototype shape")?;
                    y_masks.push(self.decode_mask(&coefs, proto, &bbox, x0.dimensions())?);
                }
                y_bboxes.push(bbox);
            }

            ys.push(DetectionResult::new(
                None,
                (!y_bboxes.is_empty()).then_some(y_bboxes),
                (!y_kpts.is_empty()).then_some(y_kpts),
                (!y_masks.is_empty()).then_some(y_masks),
            ));
        }

        Ok(ys)
    }

    /// 掩膜解码: coefs · protos → sigmoid → 还原到原图 → 裁剪到检测框
    ///
    /// 返回原图尺寸的单通道掩膜, 前景 255, 背景 0
    fn decode_mask(
        &self,
        coefs: &[f32],
        proto: ArrayView3<f32>,
        bbox: &Bbox,
        (w0, h0): (u32, u32),
    ) -> Result<Vec<u8>> {
        let (nm, nh, nw) = proto.dim();
        let coefs = Array::from_shape_vec((1, nm), coefs.to_vec())?;
        let proto = proto.to_owned().into_shape_with_order((nm, nh * nw))?;
        let mask = coefs.dot(&proto);

        let mut mask_im = GrayImage::new(nw as u32, nh as u32);
        for (i, v) in mask.iter().enumerate() {
            let p = 1. / (1. + (-v).exp());
            mask_im.put_pixel((i % nw) as u32, (i / nw) as u32, Luma([(p * 255.) as u8]));
        }

        let (_, w_mask, h_mask) = scale_wh(w0 as f32, h0 as f32, nw as f32, nh as f32);
        let cropped =
            imageops::crop_imm(&mask_im, 0, 0, (w_mask as u32).max(1), (h_mask as u32).max(1))
                .to_image();
        let full = imageops::resize(&cropped, w0, h0, imageops::FilterType::Triangle);

        let mut out = vec![0u8; (w0 * h0) as usize];
        for (x, y, p) in full.enumerate_pixels() {
            let inside = (x as f32) >= bbox.xmin()
                && (x as f32) <= bbox.xmax()
                && (y as f32) >= bbox.ymin()
                && (y as f32) <= bbox.ymax();
            if inside && p.0[0] > 127 {
                out[(y * w0 + x) as usize] = 255;
            }
        }
        Ok(out)
    }
}

// 实现统一的 Model trait
impl super::Model for YOLOv8 {
    fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
        Ok(vec![YOLOv8::preprocess(self, images)?])
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
        self.post.postprocess(xs, xs0)
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn task(&self) -> YOLOTask {
        self.post.config.task
    }

    fn summary(&self) {
        YOLOv8::summary(self)
    }
}
