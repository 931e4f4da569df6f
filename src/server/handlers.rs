// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 路由处理函数

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::errors::AppError;
use super::stream::{mjpeg_stream, StreamSession, BOUNDARY};
use super::upload::{collect_form, save_upload};
use super::AppState;
use crate::models::Model;
use crate::renderer::save_jpeg;

/// 模板缺失时使用的首页
const FALLBACK_INDEX: &str = include_str!("../../templates/index.html");

pub async fn index(State(state): State<AppState>) -> Html<String> {
    match tokio::fs::read_to_string(&state.config.template).await {
        Ok(page) => Html(page),
        Err(e) => {
            warn!(
                "⚠️ 模板 {} 读取失败: {}, 使用内置页面",
                state.config.template.display(),
                e
            );
            Html(FALLBACK_INDEX.to_string())
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let streaming = state
        .webcam
        .lock()
        .await
        .session
        .as_ref()
        .is_some_and(|s| s.is_streaming());
    Json(json!({ "status": "ok", "streaming": streaming }))
}

/// 单张图片推理
pub async fn run_image_inference(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, AppError> {
    let mut form = collect_form(multipart).await?;
    let (Some(model_file), Some(image_file)) = (form.take_file("model"), form.take_file("image"))
    else {
        return Err(AppError::MissingField("Model or image missing"));
    };

    let dir = state.config.output_dir();
    let model_path = save_upload(&dir, &model_file).await?;
    let image_path = save_upload(&dir, &image_file).await?;
    info!(
        "🖼️ 图片推理: 模型 {} | 图片 {}",
        model_path.display(),
        image_path.display()
    );

    let output_name = format!("result_{}.jpg", uuid::Uuid::new_v4().simple());
    let output_path = dir.join(&output_name);

    let loader = state.loader.clone();
    let renderer = state.renderer.clone();
    let quality = state.config.jpeg_quality;
    let out = output_path.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut model = loader.load(&model_path)?;
        let image = image::open(&image_path)
            .with_context(|| format!("Failed to decode image {}", image_path.display()))?;
        let results = model.forward(std::slice::from_ref(&image))?;
        let annotated = renderer.plot(&image, results.first(), model.names());
        save_jpeg(&annotated, &out, quality)
    })
    .await??;

    info!("✅ 结果已保存: {}", output_path.display());
    Ok(Json(json!({ "result_image": state.config.output_url(&output_name) })))
}

/// 保存并加载上传的模型, 打开摄像头, 登记为当前会话
///
/// 已有会话时先停止旧会话再打开设备. 打开设备期间不持有会话锁,
/// `/stop_webcam`、`/health`、`/video_feed` 不会被阻塞
async fn open_session(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(Arc<StreamSession>, Option<usize>), AppError> {
    let mut form = collect_form(multipart).await?;
    let Some(model_file) = form.take_file("model") else {
        return Err(AppError::MissingField("Model missing"));
    };
    let frames = match form.field("frames").map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(
            s.parse::<usize>()
                .map_err(|_| AppError::BadRequest(format!("Invalid frames value: {}", s)))?,
        ),
    };

    let model_path = save_upload(&state.config.output_dir(), &model_file).await?;
    let loader = state.loader.clone();
    let model: Box<dyn Model> =
        tokio::task::spawn_blocking(move || loader.load(&model_path)).await??;

    let old = state.webcam.lock().await.session.take();
    if let Some(old) = old {
        info!("🔁 替换正在运行的摄像头会话");
        old.stop();
    }

    let cameras = state.cameras.clone();
    let index = state.config.camera.index;
    let capture = tokio::task::spawn_blocking(move || cameras.open(index)).await??;

    let session = Arc::new(StreamSession::new(model, capture));
    // 打开期间另一个请求已登记的会话同样被替换
    if let Some(other) = state.webcam.lock().await.session.replace(session.clone()) {
        other.stop();
    }
    info!("🎥 摄像头 {} 已启动", index);
    Ok((session, frames))
}

pub async fn start_webcam(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, AppError> {
    open_session(&state, multipart).await?;
    Ok(Json(json!({ "status": "Webcam started" })))
}

/// 在服务端循环推理直到停止 / 读帧失败 / 达到 frames 帧
///
/// 服务端没有显示窗口: 逐帧推理绘制, 返回处理帧数和最后一帧结果图
pub async fn run_webcam(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, AppError> {
    let (session, limit) = open_session(&state, multipart).await?;

    let renderer = state.renderer.clone();
    let looping = session.clone();
    let (frames, last) = tokio::task::spawn_blocking(move || {
        let mut frames = 0usize;
        let mut last = None;
        while limit.map_or(true, |n| frames < n) {
            let Some(annotated) = looping.next_annotated(&renderer) else {
                break;
            };
            frames += 1;
            last = Some(annotated);
        }
        (frames, last)
    })
    .await?;

    session.stop();
    {
        let mut webcam = state.webcam.lock().await;
        if webcam
            .session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, &session))
        {
            webcam.session = None;
        }
    }

    let result_image = match last {
        Some(annotated) => {
            let name = format!("result_{}.jpg", uuid::Uuid::new_v4().simple());
            let path: PathBuf = state.config.output_dir().join(&name);
            let quality = state.config.jpeg_quality;
            tokio::task::spawn_blocking(move || save_jpeg(&annotated, &path, quality)).await??;
            Some(state.config.output_url(&name))
        }
        None => None,
    };

    info!("📹 摄像头推理结束, 共 {} 帧", frames);
    Ok(Json(json!({
        "status": "Webcam finished",
        "frames": frames,
        "result_image": result_image,
    })))
}

pub async fn video_feed(State(state): State<AppState>) -> Response {
    let session = state.webcam.lock().await.session.clone();
    let stream = mjpeg_stream(session, state.renderer.clone(), state.config.jpeg_quality);
    (
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
        )],
        Body::from_stream(stream),
    )
        .into_response()
}

pub async fn stop_webcam(State(state): State<AppState>) -> Json<Value> {
    if let Some(session) = state.webcam.lock().await.session.take() {
        session.stop();
        info!("🛑 摄像头已停止");
    }
    Json(json!({ "status": "Webcam stopped" }))
}
