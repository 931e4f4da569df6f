// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 摄像头推理会话与 MJPEG 推流

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use futures::Stream;
use image::{DynamicImage, RgbImage};
use tracing::{debug, warn};

use crate::input::Capture;
use crate::models::Model;
use crate::renderer::{encode_jpeg, Renderer};

/// multipart/x-mixed-replace 的分隔符
pub const BOUNDARY: &str = "frame";

/// 一次摄像头会话: 模型 + 设备 + 推流标志
pub struct StreamSession {
    model: Mutex<Box<dyn Model>>,
    capture: Arc<dyn Capture>,
    streaming: AtomicBool,
}

impl StreamSession {
    pub fn new(model: Box<dyn Model>, capture: Arc<dyn Capture>) -> Self {
        Self {
            model: Mutex::new(model),
            capture,
            streaming: AtomicBool::new(true),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// 清除推流标志并释放设备, 可重复调用
    pub fn stop(&self) {
        self.streaming.store(false, Ordering::SeqCst);
        self.capture.release();
    }

    /// 读一帧 → 推理 → 绘制
    ///
    /// 会话已停止、读帧失败或推理失败时返回 None
    pub fn next_annotated(&self, renderer: &Renderer) -> Option<RgbImage> {
        if !self.is_streaming() {
            return None;
        }
        let frame = DynamicImage::ImageRgb8(self.capture.read()?);

        let mut model = match self.model.lock() {
            Ok(model) => model,
            Err(_) => {
                warn!("⚠️ 模型锁已损坏, 结束推流");
                return None;
            }
        };
        let results = match model.forward(std::slice::from_ref(&frame)) {
            Ok(results) => results,
            Err(e) => {
                warn!("⚠️ 推理失败, 结束推流: {:#}", e);
                return None;
            }
        };
        let result = results.first();
        debug!("🎯 检测到 {} 个目标", result.map_or(0, |r| r.num_objects()));
        Some(renderer.plot(&frame, result, model.names()))
    }

    /// 下一帧 JPEG
    pub fn next_frame(&self, renderer: &Renderer, quality: u8) -> Option<Vec<u8>> {
        let annotated = self.next_annotated(renderer)?;
        match encode_jpeg(&annotated, quality) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!("⚠️ {:#}", e);
                None
            }
        }
    }
}

/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// 逐帧推流, 会话停止或读帧失败时结束
pub fn mjpeg_stream(
    session: Option<Arc<StreamSession>>,
    renderer: Arc<Renderer>,
    quality: u8,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold(session, move |session| {
        let renderer = renderer.clone();
        async move {
            let current = session.clone()?;
            let jpeg = tokio::task::spawn_blocking(move || current.next_frame(&renderer, quality))
                .await
                .ok()
                .flatten();
            match jpeg {
                Some(jpeg) => Some((Ok(multipart_part(&jpeg)), session)),
                None => {
                    debug!("📹 推流结束");
                    None
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_part_framing() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(part.as_ref(), expected.as_slice());
    }
}
