// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// HTTP 路由测试: 假模型 + 假摄像头, 不依赖 ONNX 文件与真实设备

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat, RgbImage};
use ndarray::{Array, IxDyn};
use serde_json::Value;
use tower::util::ServiceExt; // for `oneshot`

use yolo_web::input::{CameraOpener, Capture, CaptureError};
use yolo_web::server::{create_app, AppState};
use yolo_web::{Bbox, DetectionResult, Model, ModelLoader, ServerConfig, YOLOTask};

const BOUNDARY: &str = "XTESTBOUNDARYX";
const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

// ---------- fakes ----------

struct FakeModel {
    names: Vec<String>,
}

impl Model for FakeModel {
    fn preprocess(&mut self, _images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
        Ok(vec![])
    }

    fn run(&mut self, xs: Vec<Array<f32, IxDyn>>, _profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        Ok(xs)
    }

    fn postprocess(
        &self,
        _xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>> {
        Ok(xs0
            .iter()
            .map(|_| {
                DetectionResult::new(
                    None,
                    Some(vec![Bbox::new(2., 2., 10., 8., 0, 0.9)]),
                    None,
                    None,
                )
            })
            .collect())
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn task(&self) -> YOLOTask {
        YOLOTask::Detect
    }

    fn summary(&self) {}
}

/// 文件内容为 "bad" 时加载失败
struct FakeLoader;

impl ModelLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Model>> {
        let bytes = std::fs::read(path)?;
        if bytes == b"bad" {
            anyhow::bail!("not an onnx model");
        }
        Ok(Box::new(FakeModel {
            names: vec!["person".to_string()],
        }))
    }
}

struct NoCamera;

impl CameraOpener for NoCamera {
    fn open(&self, index: usize) -> Result<Arc<dyn Capture>, CaptureError> {
        Err(CaptureError::Unavailable {
            index,
            reason: "no device".to_string(),
        })
    }
}

/// 产出固定帧数后读取失败
struct FakeCamera {
    frames: usize,
    last: std::sync::Mutex<Option<Arc<FakeCapture>>>,
}

impl FakeCamera {
    fn new(frames: usize) -> Self {
        Self {
            frames,
            last: std::sync::Mutex::new(None),
        }
    }

    fn last_capture(&self) -> Option<Arc<FakeCapture>> {
        self.last.lock().unwrap().clone()
    }
}

impl CameraOpener for FakeCamera {
    fn open(&self, _index: usize) -> Result<Arc<dyn Capture>, CaptureError> {
        let capture = Arc::new(FakeCapture {
            remaining: AtomicUsize::new(self.frames),
            opened: AtomicBool::new(true),
        });
        *self.last.lock().unwrap() = Some(capture.clone());
        Ok(capture)
    }
}

/// 打开设备时阻塞, 直到测试放行
struct GatedCamera {
    entered: AtomicBool,
    gate: std::sync::Mutex<mpsc::Receiver<()>>,
}

impl CameraOpener for GatedCamera {
    fn open(&self, _index: usize) -> Result<Arc<dyn Capture>, CaptureError> {
        self.entered.store(true, Ordering::SeqCst);
        let _ = self.gate.lock().unwrap().recv();
        Ok(Arc::new(FakeCapture {
            remaining: AtomicUsize::new(usize::MAX),
            opened: AtomicBool::new(true),
        }))
    }
}

struct FakeCapture {
    remaining: AtomicUsize,
    opened: AtomicBool,
}

impl Capture for FakeCapture {
    fn read(&self) -> Option<RgbImage> {
        if !self.is_opened() {
            return None;
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| RgbImage::from_pixel(32, 24, image::Rgb([40, 80, 120])))
    }

    fn release(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }

    fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }
}

// ---------- helpers ----------

struct TestApp {
    app: Router,
    static_dir: PathBuf,
    _dir: tempfile::TempDir,
}

fn setup(cameras: Arc<dyn CameraOpener>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let static_dir = dir.path().join("static");
    let config = ServerConfig {
        static_dir: static_dir.clone(),
        template: dir.path().join("missing/index.html"),
        ..ServerConfig::default()
    };
    let state = AppState::new(config, Arc::new(FakeLoader), cameras);
    TestApp {
        app: create_app(state),
        static_dir,
        _dir: dir,
    }
}

enum Part<'a> {
    File(&'a str, &'a str, &'a [u8]),
    Text(&'a str, &'a str),
}

fn multipart_request(uri: &str, parts: &[Part]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::File(name, filename, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn png_bytes() -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, image::Rgb([200, 10, 10])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn start_request(uri: &str) -> Request<Body> {
    multipart_request(uri, &[Part::File("model", "yolov8n.onnx", b"weights")])
}

async fn is_streaming(app: &Router) -> bool {
    let (_, json) = send_json(app, empty_request(Method::GET, "/health")).await;
    json["streaming"] == true
}

/// 等待条件成立, 超时则测试失败
async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn count_parts(body: &[u8]) -> usize {
    body.windows(PART_HEADER.len())
        .filter(|w| *w == PART_HEADER)
        .count()
}

// ---------- /run_image_inference ----------

#[tokio::test]
async fn image_inference_requires_both_fields() {
    let t = setup(Arc::new(NoCamera));

    let (status, json) = send_json(&t.app, multipart_request("/run_image_inference", &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Model or image missing");

    let req = multipart_request(
        "/run_image_inference",
        &[Part::File("model", "yolov8n.onnx", b"weights")],
    );
    let (status, json) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Model or image missing");

    let png = png_bytes();
    let req = multipart_request("/run_image_inference", &[Part::File("image", "bus.png", &png)]);
    let (status, _) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // 空文件名等同于未上传
    let req = multipart_request(
        "/run_image_inference",
        &[
            Part::File("model", "", b"weights"),
            Part::File("image", "bus.png", &png),
        ],
    );
    let (status, _) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn image_inference_rejects_non_multipart() {
    let t = setup(Arc::new(NoCamera));
    let (status, json) =
        send_json(&t.app, empty_request(Method::POST, "/run_image_inference")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Model or image missing");
}

#[tokio::test]
async fn image_inference_writes_result() {
    let t = setup(Arc::new(NoCamera));
    let png = png_bytes();
    let req = multipart_request(
        "/run_image_inference",
        &[
            Part::File("model", "yolov8n.onnx", b"weights"),
            Part::File("image", "bus.png", &png),
        ],
    );
    let (status, json) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);

    let url = json["result_image"].as_str().unwrap();
    let name = url.strip_prefix("/static/outputs/").unwrap();
    let hex = name
        .strip_prefix("result_")
        .and_then(|s| s.strip_suffix(".jpg"))
        .unwrap();
    assert_eq!(hex.len(), 32);
    assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));

    let outputs = t.static_dir.join("outputs");
    let result = image::open(outputs.join(name)).unwrap();
    assert_eq!((result.width(), result.height()), (64, 48));
    // 上传文件按原文件名保存
    assert_eq!(std::fs::read(outputs.join("yolov8n.onnx")).unwrap(), b"weights");
    assert!(outputs.join("bus.png").exists());

    // 结果图可以通过静态路由访问
    let (status, body) = send(&t.app, empty_request(Method::GET, url)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
}

#[tokio::test]
async fn image_inference_strips_upload_paths() {
    let t = setup(Arc::new(NoCamera));
    let png = png_bytes();
    let req = multipart_request(
        "/run_image_inference",
        &[
            Part::File("model", "../../escape.onnx", b"weights"),
            Part::File("image", "bus.png", &png),
        ],
    );
    let (status, _) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(t.static_dir.join("outputs/escape.onnx").exists());
    assert!(!t.static_dir.join("../escape.onnx").exists());
}

#[tokio::test]
async fn image_inference_reports_model_errors() {
    let t = setup(Arc::new(NoCamera));
    let png = png_bytes();
    let req = multipart_request(
        "/run_image_inference",
        &[
            Part::File("model", "broken.onnx", b"bad"),
            Part::File("image", "bus.png", &png),
        ],
    );
    let (status, json) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].as_str().unwrap().contains("not an onnx model"));
}

// ---------- webcam ----------

#[tokio::test]
async fn start_webcam_requires_model() {
    let t = setup(Arc::new(FakeCamera::new(1)));
    let (status, json) = send_json(&t.app, multipart_request("/start_webcam", &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Model missing");
}

#[tokio::test]
async fn start_webcam_without_camera_is_500() {
    let t = setup(Arc::new(NoCamera));
    let req = multipart_request(
        "/start_webcam",
        &[Part::File("model", "yolov8n.onnx", b"weights")],
    );
    let (status, json) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Webcam not accessible");

    let (_, json) = send_json(&t.app, empty_request(Method::GET, "/health")).await;
    assert_eq!(json["streaming"], false);
}

#[tokio::test]
async fn video_feed_streams_annotated_frames() {
    let t = setup(Arc::new(FakeCamera::new(3)));
    let req = multipart_request(
        "/start_webcam",
        &[Part::File("model", "yolov8n.onnx", b"weights")],
    );
    let (status, json) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "Webcam started");

    let resp = t
        .app
        .clone()
        .oneshot(empty_request(Method::GET, "/video_feed"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );

    // 第 4 次读帧失败, 流随之结束
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(count_parts(&body), 3);
    assert!(body.starts_with(PART_HEADER));
    assert_eq!(&body[PART_HEADER.len()..PART_HEADER.len() + 2], &[0xFF, 0xD8]);
    assert!(body.ends_with(b"\r\n"));
}

#[tokio::test]
async fn stop_webcam_is_idempotent() {
    let cameras = Arc::new(FakeCamera::new(100));
    let t = setup(cameras.clone());

    for _ in 0..2 {
        let (status, json) = send_json(&t.app, empty_request(Method::POST, "/stop_webcam")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "Webcam stopped");
    }

    let req = multipart_request(
        "/start_webcam",
        &[Part::File("model", "yolov8n.onnx", b"weights")],
    );
    let (status, _) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send_json(&t.app, empty_request(Method::GET, "/health")).await;
    assert_eq!(json["streaming"], true);

    for _ in 0..2 {
        let (status, json) = send_json(&t.app, empty_request(Method::POST, "/stop_webcam")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "Webcam stopped");
    }

    // 设备已释放, 推流立即结束
    assert!(!cameras.last_capture().unwrap().is_opened());
    let (_, json) = send_json(&t.app, empty_request(Method::GET, "/health")).await;
    assert_eq!(json["streaming"], false);
    let (status, body) = send(&t.app, empty_request(Method::GET, "/video_feed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count_parts(&body), 0);
}

#[tokio::test]
async fn stop_webcam_ends_active_video_feed() {
    let cameras = Arc::new(FakeCamera::new(usize::MAX));
    let t = setup(cameras.clone());
    assert_eq!(send_json(&t.app, start_request("/start_webcam")).await.0, StatusCode::OK);

    let resp = t
        .app
        .clone()
        .oneshot(empty_request(Method::GET, "/video_feed"))
        .await
        .unwrap();
    let mut stream = resp.into_body().into_data_stream();
    for _ in 0..3 {
        let chunk = stream.next().await.unwrap().unwrap();
        assert!(chunk.starts_with(PART_HEADER));
    }

    let (status, _) = send_json(&t.app, empty_request(Method::POST, "/stop_webcam")).await;
    assert_eq!(status, StatusCode::OK);

    // 设备无限出帧, 只有停止才能让流结束
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        let mut n = 0usize;
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
            n += 1;
        }
        n
    })
    .await
    .expect("video feed kept streaming after stop");
    assert!(rest <= 1, "{} frames after stop", rest);
    assert!(!cameras.last_capture().unwrap().is_opened());
}

#[tokio::test]
async fn stop_webcam_ends_unbounded_run_webcam() {
    let t = setup(Arc::new(FakeCamera::new(usize::MAX)));

    let app = t.app.clone();
    let run = tokio::spawn(async move { send_json(&app, start_request("/run_webcam")).await });

    wait_until(|| is_streaming(&t.app)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (status, _) = send_json(&t.app, empty_request(Method::POST, "/stop_webcam")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run_webcam kept looping after stop")
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "Webcam finished");
    assert!(json["frames"].as_u64().unwrap() > 0);
    assert!(json["result_image"].is_string());
    assert!(!is_streaming(&t.app).await);
}

#[tokio::test]
async fn opening_camera_does_not_block_other_routes() {
    let (release, gate) = mpsc::channel();
    let cameras = Arc::new(GatedCamera {
        entered: AtomicBool::new(false),
        gate: std::sync::Mutex::new(gate),
    });
    let t = setup(cameras.clone());

    let app = t.app.clone();
    let start = tokio::spawn(async move { send_json(&app, start_request("/start_webcam")).await });
    wait_until(|| {
        let entered = cameras.entered.load(Ordering::SeqCst);
        async move { entered }
    })
    .await;

    // 设备还在打开中, 其它路由照常响应
    let quick = Duration::from_secs(1);
    let (status, json) =
        tokio::time::timeout(quick, send_json(&t.app, empty_request(Method::GET, "/health")))
            .await
            .expect("/health blocked while the camera was opening");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["streaming"], false);
    let (status, _) = tokio::time::timeout(
        quick,
        send_json(&t.app, empty_request(Method::POST, "/stop_webcam")),
    )
    .await
    .expect("/stop_webcam blocked while the camera was opening");
    assert_eq!(status, StatusCode::OK);

    release.send(()).unwrap();
    let (status, json) = start.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "Webcam started");
    assert!(is_streaming(&t.app).await);
}

#[tokio::test]
async fn restart_replaces_previous_session() {
    let cameras = Arc::new(FakeCamera::new(100));
    let t = setup(cameras.clone());
    let start = || {
        multipart_request(
            "/start_webcam",
            &[Part::File("model", "yolov8n.onnx", b"weights")],
        )
    };

    assert_eq!(send_json(&t.app, start()).await.0, StatusCode::OK);
    let first = cameras.last_capture().unwrap();
    assert_eq!(send_json(&t.app, start()).await.0, StatusCode::OK);
    let second = cameras.last_capture().unwrap();

    assert!(!first.is_opened());
    assert!(second.is_opened());
}

#[tokio::test]
async fn run_webcam_counts_frames() {
    let t = setup(Arc::new(FakeCamera::new(5)));

    let req = multipart_request(
        "/run_webcam",
        &[
            Part::File("model", "yolov8n.onnx", b"weights"),
            Part::Text("frames", "3"),
        ],
    );
    let (status, json) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "Webcam finished");
    assert_eq!(json["frames"], 3);
    let url = json["result_image"].as_str().unwrap();
    let name = url.strip_prefix("/static/outputs/").unwrap();
    assert!(t.static_dir.join("outputs").join(name).exists());

    // 不限帧数: 读到设备结束为止
    let req = multipart_request(
        "/run_webcam",
        &[Part::File("model", "yolov8n.onnx", b"weights")],
    );
    let (status, json) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["frames"], 5);

    let (_, json) = send_json(&t.app, empty_request(Method::GET, "/health")).await;
    assert_eq!(json["streaming"], false);
}

#[tokio::test]
async fn run_webcam_errors() {
    let t = setup(Arc::new(NoCamera));
    let (status, json) = send_json(&t.app, multipart_request("/run_webcam", &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Model missing");

    let req = multipart_request(
        "/run_webcam",
        &[Part::File("model", "yolov8n.onnx", b"weights")],
    );
    let (status, json) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Webcam not accessible");

    let req = multipart_request(
        "/run_webcam",
        &[
            Part::File("model", "yolov8n.onnx", b"weights"),
            Part::Text("frames", "many"),
        ],
    );
    let (status, _) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------- misc ----------

#[tokio::test]
async fn index_falls_back_to_embedded_page() {
    let t = setup(Arc::new(NoCamera));
    let (status, body) = send(&t.app, empty_request(Method::GET, "/")).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("/run_image_inference"));
    assert!(html.contains("/video_feed"));
}

#[tokio::test]
async fn health_reports_idle() {
    let t = setup(Arc::new(NoCamera));
    let (status, json) = send_json(&t.app, empty_request(Method::GET, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["streaming"], false);
}
