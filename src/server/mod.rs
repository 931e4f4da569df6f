// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// HTTP 服务 (axum)
//
// 路由:
// - GET  /                    首页
// - POST /run_image_inference 单张图片推理
// - POST /start_webcam        打开摄像头, 配合 /video_feed 推流
// - POST /run_webcam          服务端循环推理
// - GET  /video_feed          multipart/x-mixed-replace JPEG 流
// - POST /stop_webcam         停止推流并释放摄像头
// - GET  /health
// - GET  /static/...          结果图片

pub mod errors;
pub mod handlers;
pub mod stream;
pub mod upload;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::input::{CameraOpener, FfmpegCameraOpener};
use crate::models::{ModelLoader, OrtModelLoader};
use crate::renderer::Renderer;
use crate::ServerConfig;

pub use errors::AppError;
pub use stream::StreamSession;

/// 进程内唯一的摄像头状态
#[derive(Default)]
pub struct WebcamState {
    pub session: Option<Arc<StreamSession>>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub loader: Arc<dyn ModelLoader>,
    pub cameras: Arc<dyn CameraOpener>,
    pub renderer: Arc<Renderer>,
    pub webcam: Arc<Mutex<WebcamState>>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        loader: Arc<dyn ModelLoader>,
        cameras: Arc<dyn CameraOpener>,
    ) -> Self {
        let renderer = Renderer::new(config.font.as_deref());
        Self {
            config: Arc::new(config),
            loader,
            cameras,
            renderer: Arc::new(renderer),
            webcam: Arc::new(Mutex::new(WebcamState::default())),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let static_dir = state.config.static_dir.clone();
    let body_limit = state.config.max_upload_bytes();

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/run_image_inference", post(handlers::run_image_inference))
        .route("/start_webcam", post(handlers::start_webcam))
        .route("/run_webcam", post(handlers::run_webcam))
        .route("/video_feed", get(handlers::video_feed))
        .route("/stop_webcam", post(handlers::stop_webcam))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 按配置启动服务, 直到进程退出
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let output_dir = config.output_dir();
    tokio::fs::create_dir_all(&output_dir)
        .await
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let loader = Arc::new(OrtModelLoader::new(config.model.clone()));
    let cameras = Arc::new(FfmpegCameraOpener::new(config.camera.clone()));
    let addr = config.addr();
    let app = create_app(AppState::new(config, loader, cameras));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🚀 服务已启动: http://{}", addr);
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
