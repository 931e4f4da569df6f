// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理引擎封装
// 负责: 会话创建、执行后端选择、Ultralytics 元数据解析、前向推理

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use once_cell::sync::Lazy;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Value, ValueType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 默认输入尺寸 (元数据与配置都缺失时使用)
pub const DEFAULT_IMAGE_SIZE: u32 = 640;

/// Ultralytics 导出时写入的元数据键
const METADATA_KEYS: [&str; 7] = [
    "names", "imgsz", "kpt_shape", "task", "author", "version", "batch",
];

/// `{0: 'person', 1: 'bicycle'}` 中的类别名
static NAMES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(['"])([-()\w '"]+?)(['"])"#).unwrap());
static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum YOLOTask {
    // YOLO tasks
    Classify,
    Detect,
    Pose,
    Segment,
}

impl YOLOTask {
    /// 解析元数据中的 `task` 字段
    pub fn from_metadata(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "classify" => Some(YOLOTask::Classify),
            "detect" => Some(YOLOTask::Detect),
            "pose" => Some(YOLOTask::Pose),
            "segment" => Some(YOLOTask::Segment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtEP {
    // ONNXRuntime execution provider
    CPU,
    CUDA(i32),
    Trt(i32),
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    // ORT config
    pub f: PathBuf,
    pub task: Option<YOLOTask>,
    pub ep: OrtEP,
    pub trt_fp16: bool,
    pub image_size: (Option<u32>, Option<u32>),
}

/// 从元数据里抽取类别名列表
pub fn parse_names(raw: &str) -> Vec<String> {
    NAMES_RE
        .captures_iter(raw)
        .filter_map(|cap| cap.get(2).map(|m| m.as_str().to_string()))
        .collect()
}

/// 从 `[640, 640]` / `[17, 3]` / `1` 这类字符串中抽取整数
pub fn parse_ints(raw: &str) -> Vec<u32> {
    INT_RE
        .find_iter(raw)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

pub struct OrtBackend {
    // ORT engine
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    output_shapes: Vec<Vec<i64>>,
    task: YOLOTask,
    ep: OrtEP,
    batch: u32,
    height: u32,
    width: u32,
    names: Option<Vec<String>>,
    nk: Option<u32>,
    author: Option<String>,
    version: Option<String>,
}

impl OrtBackend {
    pub fn build(args: OrtConfig) -> Result<Self> {
        let providers: Vec<ExecutionProviderDispatch> = match args.ep {
            OrtEP::CPU => vec![CPUExecutionProvider::default().build()],
            OrtEP::CUDA(device_id) => vec![
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ],
            OrtEP::Trt(device_id) => vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .with_fp16(args.trt_fp16)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ],
        };

        let session = Session::builder()
            .context("Failed to create session builder")?
            .with_execution_providers(providers)
            .context("Failed to set execution providers")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("Failed to set optimization level")?
            .commit_from_file(&args.f)
            .with_context(|| format!("Failed to load model from {}", args.f.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "images".to_string());
        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();
        if output_names.is_empty() {
            anyhow::bail!("Model {} declares no outputs", args.f.display());
        }
        // 动态维度为 -1
        let output_shapes: Vec<Vec<i64>> = session
            .outputs
            .iter()
            .map(|output| match &output.output_type {
                ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
                _ => Vec::new(),
            })
            .collect();

        let metadata = Self::read_metadata(&session);
        debug!("模型元数据: {:?}", metadata);

        // task: 配置优先, 其次元数据, 默认检测
        let task = args
            .task
            .or_else(|| metadata.get("task").and_then(|t| YOLOTask::from_metadata(t)))
            .unwrap_or(YOLOTask::Detect);

        // height, width: 配置优先, 其次元数据 imgsz
        let imgsz = metadata.get("imgsz").map(|s| parse_ints(s)).unwrap_or_default();
        let height = args
            .image_size
            .0
            .or_else(|| imgsz.first().copied())
            .unwrap_or(DEFAULT_IMAGE_SIZE);
        let width = args
            .image_size
            .1
            .or_else(|| imgsz.get(1).copied())
            .unwrap_or(height);

        let batch = metadata
            .get("batch")
            .and_then(|s| parse_ints(s).first().copied())
            .unwrap_or(1);
        let names = metadata
            .get("names")
            .map(|s| parse_names(s))
            .filter(|names| !names.is_empty());
        let nk = metadata
            .get("kpt_shape")
            .and_then(|s| parse_ints(s).first().copied());

        info!(
            "✅ ONNX 模型加载成功: {} ({:?}, {}x{}, EP: {:?})",
            args.f.display(),
            task,
            width,
            height,
            args.ep
        );

        Ok(Self {
            session,
            input_name,
            output_names,
            output_shapes,
            task,
            ep: args.ep,
            batch,
            height,
            width,
            names,
            nk,
            author: metadata.get("author").cloned(),
            version: metadata.get("version").cloned(),
        })
    }

    fn read_metadata(session: &Session) -> HashMap<String, String> {
        let mut map = HashMap::new();
        let Ok(metadata) = session.metadata() else {
            return map;
        };
        for key in METADATA_KEYS {
            if let Ok(Some(value)) = metadata.custom(key) {
                map.insert(key.to_string(), value);
            }
        }
        map
    }

    /// 前向推理: 单输入, 按声明顺序返回全部输出
    pub fn run(&mut self, xs: Array<f32, IxDyn>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        let t = Instant::now();
        let input = Value::from_array(xs).context("Failed to create input tensor")?;
        let outputs = self
            .session
            .run(ort::inputs![&self.input_name => input])
            .context("Inference failed")?;

        let mut ys = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let y = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .with_context(|| format!("Failed to extract output tensor `{}`", name))?;
            ys.push(y.into_owned());
        }
        if profile {
            debug!("[ORT H2D + Inference + D2H]: {:?}", t.elapsed());
        }
        Ok(ys)
    }

    pub fn task(&self) -> YOLOTask {
        self.task
    }

    pub fn ep(&self) -> &OrtEP {
        &self.ep
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn nc(&self) -> Option<u32> {
        self.names.as_ref().map(|names| names.len() as u32)
    }

    pub fn nk(&self) -> Option<u32> {
        self.nk
    }

    pub fn names(&self) -> Option<Vec<String>> {
        self.names.clone()
    }

    /// 第 i 个输出声明的形状
    pub fn output_shape(&self, i: usize) -> Option<&[i64]> {
        self.output_shapes.get(i).map(Vec::as_slice)
    }

    pub fn num_outputs(&self) -> usize {
        self.output_names.len()
    }

    pub fn author(&self) -> Option<&String> {
        self.author.as_ref()
    }

    pub fn version(&self) -> Option<&String> {
        self.version.as_ref()
    }
}
