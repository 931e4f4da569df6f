// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// multipart 表单解析与上传文件落盘

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::Multipart;
use tracing::{debug, warn};

use super::errors::AppError;

/// 上传的文件字段
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Bytes,
}

/// 解析后的表单
#[derive(Debug, Default)]
pub struct UploadForm {
    files: HashMap<String, UploadedFile>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    /// 取出文件字段; 文件名为空的字段视为缺失
    pub fn take_file(&mut self, name: &str) -> Option<UploadedFile> {
        self.files.remove(name)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// 读取整个表单; 非 multipart 请求按空表单处理
pub async fn collect_form(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(e) => {
            debug!("非 multipart 请求: {}", e);
            return Ok(form);
        }
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read field `{}`: {}", name, e)))?;

        match filename {
            Some(raw) => match sanitize_filename(&raw) {
                Some(filename) => {
                    form.files.insert(name, UploadedFile { filename, bytes });
                }
                None => warn!("⚠️ 忽略文件名无效的上传字段 `{}`: {:?}", name, raw),
            },
            None => {
                form.fields
                    .insert(name, String::from_utf8_lossy(&bytes).into_owned());
            }
        }
    }

    Ok(form)
}

/// 只保留文件名的最后一段, 防止写出输出目录
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// 写入 `<dir>/<filename>`, 同名文件直接覆盖
pub async fn save_upload(dir: &Path, file: &UploadedFile) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(&file.filename);
    tokio::fs::write(&path, &file.bytes)
        .await
        .with_context(|| format!("Failed to save upload to {}", path.display()))?;
    debug!("💾 已保存上传文件 {} ({} bytes)", path.display(), file.bytes.len());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("yolov8n.onnx").as_deref(), Some("yolov8n.onnx"));
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\Users\\me\\bus.jpg").as_deref(), Some("bus.jpg"));
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename("dir/"), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[tokio::test]
    async fn test_save_upload() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("outputs");
        let file = UploadedFile {
            filename: "a.bin".into(),
            bytes: Bytes::from_static(b"abc"),
        };
        let path = save_upload(&out, &file).await.unwrap();
        assert_eq!(path, out.join("a.bin"));
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
    }
}
