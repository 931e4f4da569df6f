/// 视频输入系统 (Video Input System)
///
/// 本地摄像头采集, 解码线程独立于 HTTP 请求
/// - CameraDecoder: 本地摄像头解码器 (DirectShow/AVFoundation/V4L2)
/// - DecodeFilter:  FFmpeg 帧回调, YUV420P → RGB 后送入有界队列
/// - Capture / CameraOpener: HTTP 层只依赖这两个接口
pub mod camera;
pub mod decode_filter;

use std::sync::Arc;

use image::RgbImage;

pub use camera::{get_camera_devices, CameraDecoder, FfmpegCameraOpener};
pub use decode_filter::DecodeFilter;

/// 摄像头错误
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera {index} unavailable: {reason}")]
    Unavailable { index: usize, reason: String },
}

/// 已打开的采集设备
pub trait Capture: Send + Sync {
    /// 读取一帧; 读取失败或设备已释放时返回 None
    fn read(&self) -> Option<RgbImage>;

    /// 释放设备, 可重复调用
    fn release(&self);

    fn is_opened(&self) -> bool;
}

/// 按索引打开摄像头
pub trait CameraOpener: Send + Sync {
    fn open(&self, index: usize) -> Result<Arc<dyn Capture>, CaptureError>;
}
