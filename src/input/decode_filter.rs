/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use image::RgbImage;
use tracing::{debug, info, warn};

/// FFmpeg解码过滤器: 摄像头 → RGB帧
#[derive(Clone)]
pub struct DecodeFilter {
    pub count: usize,
    pub last: Instant,
    pub current_fps: f64,
    pub dropped_frames: usize, // 丢弃的帧数
    pub total_frames: usize,   // 总帧数
    running: Arc<AtomicBool>,  // 设备释放后置 false
    tx: Sender<RgbImage>,
}

impl DecodeFilter {
    pub fn new(tx: Sender<RgbImage>, running: Arc<AtomicBool>) -> Self {
        Self {
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
            dropped_frames: 0,
            total_frames: 0,
            running,
            tx,
        }
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        info!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        // 设备已释放: 返回错误让 FFmpeg 结束解码
        if !self.running.load(Ordering::Relaxed) {
            info!("🛑 摄像头已释放, 停止解码");
            return Err("Camera released".to_string());
        }

        self.total_frames += 1;

        let image = unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let w = (*frame.as_ptr()).width as usize;
            let h = (*frame.as_ptr()).height as usize;
            if w == 0 || h == 0 || w > 4096 || h > 4096 {
                self.dropped_frames += 1;
                if self.total_frames <= 10 {
                    warn!("⚠️ 丢弃帧 #{}: 非法分辨率 {}x{}", self.total_frames, w, h);
                }
                return Ok(None);
            }

            // YUV420P数据指针
            let y_plane = (*frame.as_ptr()).data[0];
            let u_plane = (*frame.as_ptr()).data[1];
            let v_plane = (*frame.as_ptr()).data[2];
            let y_stride = (*frame.as_ptr()).linesize[0] as usize;
            let uv_stride = (*frame.as_ptr()).linesize[1] as usize;

            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                self.dropped_frames += 1;
                return Ok(None);
            }
            if y_stride < w || uv_stride < w.div_ceil(2) {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let planes = Yuv420p {
                y: std::slice::from_raw_parts(y_plane, y_stride * h),
                u: std::slice::from_raw_parts(u_plane, uv_stride * h.div_ceil(2)),
                v: std::slice::from_raw_parts(v_plane, uv_stride * h.div_ceil(2)),
                y_stride,
                uv_stride,
            };
            planes.to_rgb(w as u32, h as u32)
        };

        self.count += 1;
        if self.last.elapsed().as_secs_f64() >= 1.0 {
            let elapsed = self.last.elapsed().as_secs_f64();
            self.current_fps = self.count as f64 / elapsed;
            debug!(
                "📺 解码统计: 实际{:.1}fps | 总帧{} | 丢弃{}",
                self.current_fps, self.total_frames, self.dropped_frames
            );
            self.last = Instant::now();
            self.count = 0;
        }

        // 队列满时丢弃新帧, 消费端总能拿到连续画面
        match self.tx.try_send(image) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.dropped_frames += 1,
            Err(TrySendError::Disconnected(_)) => {
                return Err("Frame receiver dropped".to_string());
            }
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!("✅ 解码线程退出");
    }
}

/// 一帧 YUV420P 的三个平面
pub struct Yuv420p<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub uv_stride: usize,
}

impl Yuv420p<'_> {
    /// BT.601 整数近似 YUV → RGB
    pub fn to_rgb(&self, width: u32, height: u32) -> RgbImage {
        let (w, h) = (width as usize, height as usize);
        let mut buffer = vec![0u8; w * h * 3];
        let mut out_idx = 0;
        for y in 0..h {
            let y_row = y * self.y_stride;
            let uv_row = (y >> 1) * self.uv_stride;

            for x in 0..w {
                let y_val = self.y[y_row + x] as i32;
                let u_val = self.u[uv_row + (x >> 1)] as i32 - 128;
                let v_val = self.v[uv_row + (x >> 1)] as i32 - 128;

                buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
                buffer[out_idx + 1] =
                    (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
                buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
                out_idx += 3;
            }
        }
        RgbImage::from_raw(width, height, buffer).unwrap_or_else(|| RgbImage::new(width, height))
    }
}
