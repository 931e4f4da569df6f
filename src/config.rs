// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 服务配置: 命令行参数 + 可选 JSON 配置文件

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::YOLOTask;

/// 网页推理服务参数
///
/// 未显式给出的参数沿用配置文件 (或默认值)
#[derive(Parser, Clone, Debug, Default)]
#[command(author, version, about = "YOLO 网页推理服务", long_about = None)]
pub struct Args {
    /// JSON 配置文件
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 监听地址
    #[arg(long)]
    pub host: Option<String>,

    /// 监听端口
    #[arg(short, long)]
    pub port: Option<u16>,

    /// 静态文件目录 (挂载到 /static)
    #[arg(long)]
    pub static_dir: Option<PathBuf>,

    /// 上传文件与结果图片的目录 (static 目录下的子目录名)
    #[arg(long)]
    pub outputs: Option<String>,

    /// 首页模板
    #[arg(long)]
    pub template: Option<PathBuf>,

    /// 摄像头索引
    #[arg(long)]
    pub camera: Option<usize>,

    /// 摄像头分辨率, 例如 1280x720
    #[arg(long)]
    pub camera_size: Option<String>,

    /// 摄像头帧率
    #[arg(long)]
    pub camera_fps: Option<u32>,

    /// 置信度阈值
    #[arg(long)]
    pub conf: Option<f32>,

    /// NMS IoU 阈值
    #[arg(long)]
    pub iou: Option<f32>,

    /// 关键点置信度阈值
    #[arg(long)]
    pub kconf: Option<f32>,

    /// 使用 CUDA
    #[arg(long)]
    pub cuda: bool,

    /// 使用 TensorRT
    #[arg(long)]
    pub trt: bool,

    /// TensorRT 半精度
    #[arg(long)]
    pub fp16: bool,

    /// GPU 设备号
    #[arg(long)]
    pub device_id: Option<i32>,

    /// 强制指定任务 (默认读取模型元数据)
    #[arg(long, value_enum)]
    pub task: Option<YOLOTask>,

    /// 标签字体 (TTF/OTF)
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// JPEG 编码质量
    #[arg(long)]
    pub jpeg_quality: Option<u8>,

    /// 上传大小上限 (MB)
    #[arg(long)]
    pub max_upload_mb: Option<usize>,

    /// 打印各阶段耗时
    #[arg(long)]
    pub profile: bool,
}

impl Args {
    /// 合并配置文件与命令行参数
    pub fn resolve(&self) -> ServerConfig {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path),
            None => ServerConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = &self.static_dir {
            config.static_dir = dir.clone();
        }
        if let Some(outputs) = &self.outputs {
            config.outputs = outputs.clone();
        }
        if let Some(template) = &self.template {
            config.template = template.clone();
        }
        if let Some(font) = &self.font {
            config.font = Some(font.clone());
        }
        if let Some(q) = self.jpeg_quality {
            config.jpeg_quality = q.clamp(1, 100);
        }
        if let Some(mb) = self.max_upload_mb {
            config.max_upload_mb = mb;
        }

        // camera
        if let Some(index) = self.camera {
            config.camera.index = index;
        }
        if let Some(size) = &self.camera_size {
            config.camera.video_size = Some(size.clone());
        }
        if let Some(fps) = self.camera_fps {
            config.camera.framerate = Some(fps);
        }

        // model
        let m = &mut config.model;
        if let Some(conf) = self.conf {
            m.conf = conf;
        }
        if let Some(iou) = self.iou {
            m.iou = iou;
        }
        if let Some(kconf) = self.kconf {
            m.kconf = kconf;
        }
        if let Some(device_id) = self.device_id {
            m.device_id = device_id;
        }
        if self.task.is_some() {
            m.task = self.task;
        }
        m.cuda |= self.cuda;
        m.trt |= self.trt;
        m.fp16 |= self.fp16;
        m.profile |= self.profile;

        config
    }
}

/// 摄像头参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraSettings {
    pub index: usize,               // 设备索引
    pub video_size: Option<String>, // 分辨率, 不设置则由驱动协商
    pub framerate: Option<u32>,     // 帧率
    pub open_timeout_ms: u64,       // 等待首帧的时间
    pub read_timeout_ms: u64,       // 单帧读取超时
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            index: 0,
            video_size: None,
            framerate: None,
            open_timeout_ms: 5000,
            read_timeout_ms: 2000,
        }
    }
}

/// 模型参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub device_id: i32,
    pub cuda: bool,
    pub trt: bool,
    pub fp16: bool,
    pub task: Option<YOLOTask>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub conf: f32,
    pub iou: f32,
    pub kconf: f32,
    pub profile: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            cuda: false,
            trt: false,
            fp16: false,
            task: None,
            width: None,
            height: None,
            conf: 0.25,
            iou: 0.45,
            kconf: 0.55,
            profile: false,
        }
    }
}

/// 解析后的服务配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub outputs: String,
    pub template: PathBuf,
    pub font: Option<PathBuf>,
    pub jpeg_quality: u8,
    pub max_upload_mb: usize,
    pub camera: CameraSettings,
    pub model: ModelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            static_dir: PathBuf::from("static"),
            outputs: "outputs".to_string(),
            template: PathBuf::from("templates/index.html"),
            font: None,
            jpeg_quality: 90,
            max_upload_mb: 512,
            camera: CameraSettings::default(),
            model: ModelConfig::default(),
        }
    }
}

impl ServerConfig {
    /// 从JSON文件加载配置, 失败时使用默认值
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    warn!("⚠️ 配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("⚠️ 配置文件 {} 无法读取: {}, 使用默认值", path.display(), e);
                Self::default()
            }
        }
    }

    /// 上传文件与结果图片的落盘目录
    pub fn output_dir(&self) -> PathBuf {
        self.static_dir.join(&self.outputs)
    }

    /// 结果文件对应的静态 URL
    pub fn output_url(&self, name: &str) -> String {
        format!("/static/{}/{}", self.outputs.trim_matches('/'), name)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
