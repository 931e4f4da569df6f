// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLO 网页推理服务
//
// 上传模型与图片做单张推理, 或打开本地摄像头实时推流

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use yolo_web::input::get_camera_devices;
use yolo_web::{server, Args};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = args.resolve();

    info!("🚀 YOLO 网页推理服务启动");
    info!("📂 输出目录: {}", config.output_dir().display());
    info!(
        "⚙️ conf: {} | iou: {} | kconf: {} | CUDA: {} | TensorRT: {}",
        config.model.conf, config.model.iou, config.model.kconf, config.model.cuda, config.model.trt
    );

    // 列出可用摄像头
    let devices = tokio::task::spawn_blocking(get_camera_devices).await?;
    if devices.is_empty() {
        warn!("⚠️ 未发现摄像头设备, 摄像头功能不可用");
    }
    for (index, name) in &devices {
        info!("📷 [{}] {}", index, name);
    }

    server::serve(config).await
}
