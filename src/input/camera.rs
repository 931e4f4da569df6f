//! 摄像头输入模块 - 独立的摄像头解码器
//!
//! 处理本地摄像头输入,支持 DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::decode_filter::DecodeFilter;
use super::{CameraOpener, Capture, CaptureError};
use crate::CameraSettings;

/// 解码线程与读取端之间的帧队列长度
const FRAME_QUEUE: usize = 2;

/// 摄像头解码器结构
pub struct CameraDecoder {
    device_index: usize,
    rx: Receiver<RgbImage>,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraDecoder {
    /// 打开摄像头并等待首帧; 超时视为设备不可用
    pub fn open(device_index: usize, settings: &CameraSettings) -> Result<Self, CaptureError> {
        let unavailable = |reason: String| CaptureError::Unavailable {
            index: device_index,
            reason,
        };

        let device_name = get_camera_devices()
            .into_iter()
            .find(|(i, _)| *i == device_index)
            .map(|(_, name)| name)
            .unwrap_or_default();
        let camera_url = Self::format_camera_url(device_index, &device_name);
        let format = Self::input_format();
        info!(
            "🎥 打开摄像头: 索引 {} | 名称 {:?} | URL {} | 格式 {}",
            device_index, device_name, camera_url, format
        );

        let (tx, rx) = crossbeam_channel::bounded(FRAME_QUEUE);
        let running = Arc::new(AtomicBool::new(true));
        let filter = DecodeFilter::new(tx, running.clone());

        let mut opts: HashMap<String, String> = HashMap::new();
        if let Some(size) = &settings.video_size {
            opts.insert("video_size".to_string(), size.clone());
        }
        if let Some(fps) = settings.framerate {
            opts.insert("framerate".to_string(), fps.to_string());
        }

        // 构建、启动、等待都在解码线程内完成
        // 启动结果通过 ready 通道返回
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let worker = std::thread::Builder::new()
            .name(format!("camera-{}", device_index))
            .spawn(move || {
                // 构建帧处理管线
                let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
                let pipe = pipe.filter("decode", Box::new(filter));
                let out = create_null_output().add_frame_pipeline(pipe);

                let mut input = Input::new(camera_url).set_format(format);
                if !opts.is_empty() {
                    input = input.set_input_opts(opts);
                }

                let ctx = match FfmpegContext::builder()
                    .input(input)
                    .filter_desc("format=yuv420p")
                    .output(out)
                    .build()
                {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("构建失败: {}", e)));
                        return;
                    }
                };
                let sch = match ctx.start() {
                    Ok(sch) => sch,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("启动失败: {}", e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = sch.wait();
                debug!("📹 摄像头解码循环结束");
            })
            .map_err(|e| unavailable(format!("解码线程创建失败: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                running.store(false, Ordering::SeqCst);
                return Err(unavailable(reason));
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                return Err(unavailable("解码线程异常退出".to_string()));
            }
        }

        let decoder = Self {
            device_index,
            rx,
            running,
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            worker: Mutex::new(Some(worker)),
        };

        // 首帧到达才算打开成功
        match decoder.rx.recv_timeout(Duration::from_millis(settings.open_timeout_ms)) {
            Ok(_) => {
                info!("✅ 摄像头连接成功,开始解码!");
                Ok(decoder)
            }
            Err(e) => {
                decoder.release();
                Err(unavailable(format!("等待首帧失败: {}", e)))
            }
        }
    }

    /// 输入格式 - 根据平台选择
    fn input_format() -> &'static str {
        if cfg!(target_os = "windows") {
            "dshow" // DirectShow
        } else if cfg!(target_os = "macos") {
            "avfoundation" // AVFoundation
        } else if cfg!(target_os = "linux") {
            "v4l2" // Video4Linux2
        } else {
            "video4linux2"
        }
    }

    /// 格式化摄像头URL - 根据平台选择
    fn format_camera_url(index: usize, name: &str) -> String {
        if cfg!(target_os = "windows") {
            format!("video={}", name)
        } else if cfg!(target_os = "linux") {
            format!("/dev/video{}", index)
        } else {
            format!("{}", index)
        }
    }
}

impl Capture for CameraDecoder {
    fn read(&self) -> Option<RgbImage> {
        if !self.is_opened() {
            return None;
        }
        match self.rx.recv_timeout(self.read_timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) => {
                warn!("⚠️ 摄像头 {} 读取超时", self.device_index);
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn release(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("📷 释放摄像头 {}", self.device_index);
        }
        // 解码线程在下一帧回调时退出; 设备卡住时不在这里阻塞
        if let Ok(mut worker) = self.worker.lock() {
            if worker.as_ref().is_some_and(|w| w.is_finished()) {
                if let Some(w) = worker.take() {
                    let _ = w.join();
                }
            }
        }
    }

    fn is_opened(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CameraDecoder {
    fn drop(&mut self) {
        self.release();
    }
}

/// 默认的摄像头打开方式: FFmpeg 设备输入
#[derive(Debug, Clone, Default)]
pub struct FfmpegCameraOpener {
    settings: CameraSettings,
}

impl FfmpegCameraOpener {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings }
    }
}

impl CameraOpener for FfmpegCameraOpener {
    fn open(&self, index: usize) -> Result<Arc<dyn Capture>, CaptureError> {
        let decoder = CameraDecoder::open(index, &self.settings)?;
        Ok(Arc::new(decoder))
    }
}

/// 获取可用的摄像头设备列表
pub fn get_camera_devices() -> Vec<(usize, String)> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => devices.into_iter().enumerate().collect(),
        Err(e) => {
            warn!("⚠️ 获取摄像头列表失败: {}", e);
            vec![]
        }
    }
}
