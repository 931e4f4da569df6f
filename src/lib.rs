#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 服务配置参数
pub mod input; // 摄像头输入系统
pub mod models; // 模型接口与具体实现
pub mod ort_backend; // ONNX Runtime 推理引擎
pub mod renderer; // 检测结果绘制
pub mod server; // HTTP 服务

pub use crate::config::{Args, CameraSettings, ModelConfig, ServerConfig};
pub use crate::models::{Model, ModelLoader, ModelType, OrtModelLoader, YOLOv10, YOLOv8};
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP, YOLOTask};
pub use crate::renderer::Renderer;

/// 非极大值抑制 (按类别)
///
/// 只在同一类别的框之间比较 IoU, 与 Ultralytics 默认的 `agnostic=False` 一致
pub fn non_max_suppression(
    xs: &mut Vec<(Bbox, Option<Vec<Point2>>, Option<Vec<f32>>)>,
    iou_threshold: f32,
) {
    xs.sort_by(|b1, b2| b2.0.confidence().total_cmp(&b1.0.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].0.id() != xs[index].0.id() {
                continue;
            }
            let iou = xs[prev_index].0.iou(&xs[index].0);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// COCO 17 关键点骨架连线 (0-based)
pub const SKELETON: [(usize, usize); 19] = [
    (15, 13),
    (13, 11),
    (16, 14),
    (14, 12),
    (11, 12),
    (5, 11),
    (6, 12),
    (5, 6),
    (5, 7),
    (6, 8),
    (7, 9),
    (8, 10),
    (1, 2),
    (0, 1),
    (0, 2),
    (1, 3),
    (2, 4),
    (3, 5),
    (4, 6),
];

use ndarray::{Array, IxDyn};

#[derive(Clone, PartialEq, Default)]
pub struct DetectionResult {
    // YOLO tasks results of an image
    pub probs: Option<Embedding>,
    pub bboxes: Option<Vec<Bbox>>,
    pub keypoints: Option<Vec<Vec<Point2>>>,
    pub masks: Option<Vec<Vec<u8>>>,
}

impl std::fmt::Debug for DetectionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionResult")
            .field(
                "Probs(top5)",
                &format_args!("{:?}", self.probs().map(|probs| probs.topk(5))),
            )
            .field("Bboxes", &self.bboxes)
            .field("Keypoints", &self.keypoints)
            .field(
                "Masks",
                &format_args!("{:?}", self.masks().map(|masks| masks.len())),
            )
            .finish()
    }
}

impl DetectionResult {
    pub fn new(
        probs: Option<Embedding>,
        bboxes: Option<Vec<Bbox>>,
        keypoints: Option<Vec<Vec<Point2>>>,
        masks: Option<Vec<Vec<u8>>>,
    ) -> Self {
        Self {
            probs,
            bboxes,
            keypoints,
            masks,
        }
    }

    pub fn probs(&self) -> Option<&Embedding> {
        self.probs.as_ref()
    }

    pub fn keypoints(&self) -> Option<&Vec<Vec<Point2>>> {
        self.keypoints.as_ref()
    }

    pub fn masks(&self) -> Option<&Vec<Vec<u8>>> {
        self.masks.as_ref()
    }

    pub fn bboxes(&self) -> Option<&Vec<Bbox>> {
        self.bboxes.as_ref()
    }

    /// 检测框数量 (日志用)
    pub fn num_objects(&self) -> usize {
        self.bboxes.as_ref().map_or(0, |b| b.len())
    }
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct Point2 {
    // A point2d with x, y, conf
    x: f32,
    y: f32,
    confidence: f32,
}

impl Point2 {
    pub fn new_with_conf(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Embedding {
    // An float32 n-dims tensor
    data: Array<f32, IxDyn>,
}

impl Embedding {
    pub fn new(data: Array<f32, IxDyn>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &Array<f32, IxDyn> {
        &self.data
    }

    pub fn topk(&self, k: usize) -> Vec<(usize, f32)> {
        let mut probs = self
            .data
            .iter()
            .enumerate()
            .map(|(a, b)| (a, *b))
            .collect::<Vec<_>>();
        probs.sort_by(|a, b| b.1.total_cmp(&a.1));
        probs.truncate(k);
        probs
    }

    pub fn top1(&self) -> Option<(usize, f32)> {
        self.topk(1).first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new_from_xywh(xmin: f32, ymin: f32, width: f32, height: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            ..Default::default()
        }
    }

    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(x: f32, y: f32, id: usize, conf: f32) -> (Bbox, Option<Vec<Point2>>, Option<Vec<f32>>) {
        (Bbox::new(x, y, 10., 10., id, conf), None, None)
    }

    #[test]
    fn test_iou() {
        let a = Bbox::new_from_xywh(0., 0., 10., 10.);
        let b = Bbox::new_from_xywh(5., 0., 10., 10.);
        assert!((a.iou(&b) - 50. / 150.).abs() < 1e-6);
        assert_eq!(a.iou(&Bbox::new_from_xywh(20., 20., 5., 5.)), 0.);
        assert_eq!(Bbox::default().iou(&Bbox::default()), 0.);
    }

    #[test]
    fn test_nms_keeps_highest_confidence() {
        let mut xs = vec![entry(0., 0., 0, 0.6), entry(1., 1., 0, 0.9), entry(50., 50., 0, 0.3)];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].0.confidence(), 0.9);
        assert_eq!(xs[1].0.confidence(), 0.3);
    }

    #[test]
    fn test_nms_is_per_class() {
        let mut xs = vec![entry(0., 0., 0, 0.9), entry(0., 0., 1, 0.8)];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
    }

    #[test]
    fn test_topk() {
        let e = Embedding::new(Array::from_vec(vec![0.1, 0.7, 0.2]).into_dyn());
        assert_eq!(e.topk(2), vec![(1, 0.7), (2, 0.2)]);
        assert_eq!(e.top1(), Some((1, 0.7)));
    }
}
