/// 模型统一接口与实现
///
/// # 架构说明
///
/// ## 完整模型实现 (Full Model Implementation)
/// - **YOLOv8**: Ultralytics 标准导出格式 (v5u / v8 / v11 通用)
///   - 检测 / 姿态 / 分割 / 分类 四种任务
///   - 文件: `yolov8.rs`
/// - **YOLOv10**: 端到端模型 (NMS-Free), 仅检测
///   - 文件: `yolov10.rs`
///
/// ## Model Trait
/// 统一的模型接口，定义标准流程: preprocess → run → postprocess
///
/// ## ModelLoader Trait
/// 上传的模型文件 → `Box<dyn Model>`, HTTP 层只依赖这个接口
///
/// ## 使用示例
/// ```ignore
/// use yolo_web::models::{ModelLoader, OrtModelLoader};
///
/// let loader = OrtModelLoader::new(config.model.clone());
/// let mut model = loader.load(Path::new("static/outputs/best.onnx"))?;
/// let results = model.forward(&[image])?;
/// ```
use std::path::Path;

use anyhow::Result;
use image::DynamicImage;
use ndarray::{Array, IxDyn};
use tracing::{info, warn};

use crate::{DetectionResult, ModelConfig, OrtBackend, OrtConfig, OrtEP, YOLOTask};

/// 模型类型枚举（用于自动识别模型）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// YOLOv8 标准模型 (含 YOLOv5u / YOLOv11 导出)
    YOLOv8,
    /// YOLOv10 端到端模型 (NMS-Free)
    YOLOv10,
}

impl ModelType {
    /// 从第一个输出的形状推断模型类型
    ///
    /// - `[b, n, 6]` 且 `n > 6`: 端到端输出 `[x1, y1, x2, y2, conf, cls]` → YOLOv10
    /// - `[b, 4 + nc (+ extra), anchors]` 或分类输出 `[b, nc]` → YOLOv8
    ///
    /// 维度是动态的(-1)无法判断时返回 None
    pub fn from_output_shape(shape: &[i64]) -> Option<Self> {
        match *shape {
            [_, n, 6] if n > 6 => Some(ModelType::YOLOv10),
            [_, c, a] if c > 0 && a > 0 => Some(ModelType::YOLOv8),
            [_, nc] if nc > 0 => Some(ModelType::YOLOv8),
            _ => None,
        }
    }

    /// 从模型路径推断模型类型 (输出形状无法判断时使用)
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("yolov10") || name.contains("v10") {
            ModelType::YOLOv10
        } else {
            ModelType::YOLOv8
        }
    }
}

/// 统一的深度学习模型接口
///
/// ## 核心流程
/// ```text
/// 原始图片 → preprocess → ndarray张量
///          ↓
///     推理引擎 run
///          ↓
///     原始输出 → postprocess → 检测结果
/// ```
pub trait Model: Send {
    /// 预处理: 图片 → NCHW 张量
    fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>>;

    /// 推理: 执行模型前向传播, 返回模型原始输出(未解码)
    fn run(&mut self, xs: Vec<Array<f32, IxDyn>>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>>;

    /// 后处理: 原始输出 → 检测结果
    ///
    /// # Arguments
    /// * `xs` - 模型原始输出
    /// * `xs0` - 原始图片(用于坐标还原)
    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>>;

    /// 完整的推理流程: preprocess → run → postprocess
    fn forward(&mut self, images: &[DynamicImage]) -> Result<Vec<DetectionResult>> {
        let xs = self.preprocess(images)?;
        let ys = self.run(xs, false)?;
        self.postprocess(ys, images)
    }

    /// 类别名 (按类别 id 索引)
    fn names(&self) -> &[String];

    /// 模型任务
    fn task(&self) -> YOLOTask;

    /// 打印模型信息
    fn summary(&self);
}

/// 模型加载接口: 模型文件 → 可推理的模型实例
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn Model>>;
}

/// 默认加载器: 通过 ONNX Runtime 加载, 按输出形状识别模型类型, 文件名兜底
#[derive(Debug, Clone)]
pub struct OrtModelLoader {
    config: ModelConfig,
}

impl OrtModelLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl ModelLoader for OrtModelLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Model>> {
        let engine = OrtBackend::build(OrtConfig {
            f: path.to_path_buf(),
            task: self.config.task,
            ep: execution_provider(&self.config),
            trt_fp16: self.config.fp16,
            image_size: (self.config.height, self.config.width),
        })?;

        let model_type = match engine.output_shape(0).and_then(ModelType::from_output_shape) {
            Some(model_type) => model_type,
            None => {
                let model_type = ModelType::from_path(path);
                warn!(
                    "⚠️ 输出形状 {:?} 无法识别模型类型, 按文件名使用 {:?}",
                    engine.output_shape(0),
                    model_type
                );
                model_type
            }
        };
        let model: Box<dyn Model> = match model_type {
            ModelType::YOLOv8 => Box::new(YOLOv8::from_engine(engine, &self.config)?),
            ModelType::YOLOv10 => Box::new(YOLOv10::from_engine(engine, &self.config)?),
        };
        info!(
            "✅ {:?} 模型加载成功 ({:?}): {}",
            model_type,
            model.task(),
            path.display()
        );
        model.summary();
        Ok(model)
    }
}

/// 根据配置选择执行后端
pub(crate) fn execution_provider(config: &ModelConfig) -> OrtEP {
    if config.trt {
        OrtEP::Trt(config.device_id)
    } else if config.cuda {
        OrtEP::CUDA(config.device_id)
    } else {
        OrtEP::CPU
    }
}

/// Letterbox 缩放比例: (ratio, 新宽, 新高)
pub(crate) fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// Letterbox 预处理 (左上角对齐, 其余区域填充 144/255)
///
/// 输出 NCHW, RGB, 归一化到 [0, 1]
pub(crate) fn letterbox(xs: &[DynamicImage], width: u32, height: u32) -> Result<Array<f32, IxDyn>> {
    use fast_image_resize as fr;

    let mut ys = Array::ones((xs.len(), 3, height as usize, width as usize)).into_dyn();
    ys.fill(144.0 / 255.0);

    let mut resizer = fr::Resizer::new();
    for (idx, x) in xs.iter().enumerate() {
        let rgb = x.to_rgb8();
        let (w0, h0) = rgb.dimensions();
        if w0 == 0 || h0 == 0 {
            anyhow::bail!("Empty input image");
        }
        let (_, w_new, h_new) = scale_wh(w0 as f32, h0 as f32, width as f32, height as f32);
        let (w_new, h_new) = ((w_new as u32).clamp(1, width), (h_new as u32).clamp(1, height));

        let src = fr::images::Image::from_vec_u8(w0, h0, rgb.into_raw(), fr::PixelType::U8x3)?;
        let mut dst = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x3);
        resizer.resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )?;

        for (i, px) in dst.buffer().chunks_exact(3).enumerate() {
            let x = i % w_new as usize;
            let y = i / w_new as usize;
            ys[[idx, 0, y, x]] = px[0] as f32 / 255.0;
            ys[[idx, 1, y, x]] = px[1] as f32 / 255.0;
            ys[[idx, 2, y, x]] = px[2] as f32 / 255.0;
        }
    }

    Ok(ys)
}

// 各模型的具体实现
pub mod yolov10; // YOLOv10 端到端模型 (NMS-Free)
pub mod yolov8; // YOLOv8 完整模型 + 实现 Model trait

// Re-exports
pub use yolov10::YOLOv10;
pub use yolov8::YOLOv8;
