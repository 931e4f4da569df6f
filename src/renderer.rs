// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测结果绘制: 检测框 / 标签 / 关键点骨架 / 分割掩膜 / 分类 top5

use std::io::Cursor;
use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut,
    draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use tracing::{info, warn};

use crate::{DetectionResult, SKELETON};

/// Ultralytics 默认调色板
const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

/// 姿态调色板
const POSE_PALETTE: [[u8; 3]; 20] = [
    [255, 128, 0],
    [255, 153, 51],
    [255, 178, 102],
    [230, 230, 0],
    [255, 153, 255],
    [153, 204, 255],
    [255, 102, 255],
    [255, 51, 255],
    [102, 178, 255],
    [51, 153, 255],
    [255, 153, 153],
    [255, 102, 102],
    [255, 51, 51],
    [153, 255, 153],
    [102, 255, 102],
    [51, 255, 51],
    [0, 255, 0],
    [0, 0, 255],
    [255, 0, 0],
    [255, 255, 255],
];

// COCO 17 点: 每个关键点 / 每条骨架连线在 POSE_PALETTE 中的下标
const KPT_COLOR: [usize; 17] = [16, 16, 16, 16, 16, 0, 0, 0, 0, 0, 0, 9, 9, 9, 9, 9, 9];
const LIMB_COLOR: [usize; 19] = [9, 9, 9, 9, 7, 7, 7, 0, 0, 0, 0, 0, 16, 16, 16, 16, 16, 16, 16];

/// 找不到配置字体时依次尝试的系统字体
const FALLBACK_FONTS: [&str; 6] = [
    "assets/font/msyh.ttc",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

const MASK_ALPHA: f32 = 0.5;

pub fn class_color(id: usize) -> Rgb<u8> {
    Rgb(PALETTE[id % PALETTE.len()])
}

fn pose_color(idx: usize) -> Rgb<u8> {
    Rgb(POSE_PALETTE[idx % POSE_PALETTE.len()])
}

/// 检测结果绘制器
#[derive(Clone, Default)]
pub struct Renderer {
    font: Option<FontArc>,
}

impl Renderer {
    /// 加载标签字体; 全部失败时只画框不写字
    pub fn new(font: Option<&Path>) -> Self {
        let mut candidates: Vec<PathBuf> = font.map(Path::to_path_buf).into_iter().collect();
        candidates.extend(FALLBACK_FONTS.iter().map(PathBuf::from));

        for path in candidates {
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            match FontArc::try_from_vec(bytes) {
                Ok(font) => {
                    info!("✅ 标签字体加载成功: {}", path.display());
                    return Self { font: Some(font) };
                }
                Err(e) => warn!("⚠️ 字体解析失败 {}: {}", path.display(), e),
            }
        }

        warn!("⚠️ 未找到可用字体, 结果图只绘制检测框");
        Self { font: None }
    }

    /// 绘制一张图的检测结果 (标签含类别名与置信度)
    pub fn plot(
        &self,
        img: &DynamicImage,
        result: Option<&DetectionResult>,
        names: &[String],
    ) -> RgbImage {
        let mut canvas = img.to_rgb8();
        let Some(result) = result else {
            return canvas;
        };

        let (w, h) = canvas.dimensions();
        // 线宽与 Ultralytics 一致: max(round((w + h) / 2 * 0.003), 2)
        let lw = (((w + h) as f32 / 2. * 0.003).round() as u32).max(2);

        if let Some(masks) = result.masks() {
            let ids = result.bboxes().map(|b| b.iter().map(|b| b.id()).collect::<Vec<_>>());
            for (i, mask) in masks.iter().enumerate() {
                let id = ids.as_ref().and_then(|ids| ids.get(i)).copied().unwrap_or(i);
                self.overlay_mask(&mut canvas, mask, class_color(id));
            }
        }

        if let Some(bboxes) = result.bboxes() {
            for bbox in bboxes {
                let color = class_color(bbox.id());
                let x = bbox.xmin().round() as i32;
                let y = bbox.ymin().round() as i32;
                let bw = bbox.width().round().max(1.) as u32;
                let bh = bbox.height().round().max(1.) as u32;
                for t in 0..lw {
                    if bw <= 2 * t || bh <= 2 * t {
                        break;
                    }
                    let rect =
                        Rect::at(x + t as i32, y + t as i32).of_size(bw - 2 * t, bh - 2 * t);
                    draw_hollow_rect_mut(&mut canvas, rect, color);
                }

                let name = names
                    .get(bbox.id())
                    .cloned()
                    .unwrap_or_else(|| bbox.id().to_string());
                let label = format!("{} {:.2}", name, bbox.confidence());
                self.draw_label(&mut canvas, &label, x, y, lw, color);
            }
        }

        if let Some(keypoints) = result.keypoints() {
            let radius = (lw as i32 + 1).max(3);
            for kpts in keypoints {
                let coco = kpts.len() == KPT_COLOR.len();
                for (k, (a, b)) in SKELETON.iter().enumerate() {
                    if !coco {
                        break;
                    }
                    let (p, q) = (&kpts[*a], &kpts[*b]);
                    if p.confidence() <= 0. || q.confidence() <= 0. {
                        continue;
                    }
                    draw_line_segment_mut(
                        &mut canvas,
                        (p.x(), p.y()),
                        (q.x(), q.y()),
                        pose_color(LIMB_COLOR[k]),
                    );
                }
                for (i, p) in kpts.iter().enumerate() {
                    if p.confidence() <= 0. {
                        continue;
                    }
                    let color = if coco {
                        pose_color(KPT_COLOR[i])
                    } else {
                        class_color(i)
                    };
                    let center = (p.x() as i32, p.y() as i32);
                    draw_filled_circle_mut(&mut canvas, center, radius, color);
                }
            }
        }

        if let Some(probs) = result.probs() {
            let mut y = 2 * lw as i32;
            for (id, p) in probs.topk(5) {
                let name = names.get(id).cloned().unwrap_or_else(|| id.to_string());
                let text = format!("{} {:.2}", name, p);
                if let Some(height) = self.draw_text(&mut canvas, &text, 2 * lw as i32, y, lw) {
                    y += height as i32 + lw as i32;
                }
            }
        }

        canvas
    }

    /// 标签: 实心底色 + 白字, 放在框的左上角外侧 (放不下时放在框内)
    fn draw_label(
        &self,
        canvas: &mut RgbImage,
        label: &str,
        x: i32,
        y: i32,
        lw: u32,
        color: Rgb<u8>,
    ) {
        let Some(font) = &self.font else {
            return;
        };
        let scale = PxScale::from((lw as f32 * 6.).max(12.));
        let (tw, th) = text_size(scale, font, label);
        let (bw, bh) = (tw + 2 * lw, th + 2 * lw);
        let top = if y - bh as i32 >= 0 { y - bh as i32 } else { y };

        draw_filled_rect_mut(canvas, Rect::at(x, top).of_size(bw, bh), color);
        draw_text_mut(
            canvas,
            Rgb([255, 255, 255]),
            x + lw as i32,
            top + lw as i32,
            scale,
            font,
            label,
        );
    }

    /// 左上角文字 (分类结果), 返回文字高度
    fn draw_text(
        &self,
        canvas: &mut RgbImage,
        text: &str,
        x: i32,
        y: i32,
        lw: u32,
    ) -> Option<u32> {
        let font = self.font.as_ref()?;
        let scale = PxScale::from((lw as f32 * 8.).max(14.));
        let (_, th) = text_size(scale, font, text);
        draw_text_mut(canvas, Rgb([255, 255, 255]), x, y, scale, font, text);
        Some(th)
    }

    /// 半透明叠加掩膜 (掩膜与原图同尺寸, 非零为前景)
    fn overlay_mask(&self, canvas: &mut RgbImage, mask: &[u8], color: Rgb<u8>) {
        let (w, h) = canvas.dimensions();
        if mask.len() != (w * h) as usize {
            warn!("⚠️ 掩膜尺寸不匹配: {} != {}x{}", mask.len(), w, h);
            return;
        }
        for (i, m) in mask.iter().enumerate() {
            if *m == 0 {
                continue;
            }
            let px = canvas.get_pixel_mut(i as u32 % w, i as u32 / w);
            for c in 0..3 {
                px.0[c] = (px.0[c] as f32 * (1. - MASK_ALPHA) + color.0[c] as f32 * MASK_ALPHA) as u8;
            }
        }
    }
}

/// JPEG 编码
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(img)
        .context("JPEG encoding failed")?;
    Ok(buf.into_inner())
}

/// JPEG 编码并写入文件
pub fn save_jpeg(img: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    let bytes = encode_jpeg(img, quality)?;
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bbox, Embedding, Point2};
    use ndarray::Array;

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(w, h))
    }

    #[test]
    fn test_plot_without_result_is_identity() {
        let img = blank(32, 16);
        let out = Renderer::default().plot(&img, None, &[]);
        assert_eq!(out, img.to_rgb8());
    }

    #[test]
    fn test_plot_draws_box_edges() {
        let result = DetectionResult::new(
            None,
            Some(vec![Bbox::new(10., 10., 40., 30., 0, 0.9)]),
            None,
            None,
        );
        let out = Renderer::default().plot(&blank(100, 100), Some(&result), &["person".into()]);
        assert_eq!(*out.get_pixel(10, 20), class_color(0));
        assert_eq!(*out.get_pixel(30, 10), class_color(0));
        // 框内部不被填充
        assert_eq!(*out.get_pixel(30, 25), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_plot_mask_and_keypoints() {
        let mut mask = vec![0u8; 20 * 20];
        mask[0] = 255;
        let mut kpts = vec![Point2::default(); 17];
        kpts[0] = Point2::new_with_conf(10., 10., 0.9);
        let result = DetectionResult::new(
            None,
            Some(vec![Bbox::new(5., 5., 10., 10., 1, 0.8)]),
            Some(vec![kpts]),
            Some(vec![mask]),
        );
        let out = Renderer::default().plot(&blank(20, 20), Some(&result), &[]);
        let c = class_color(1).0;
        assert_eq!(out.get_pixel(0, 0).0, [c[0] / 2, c[1] / 2, c[2] / 2]);
        assert_eq!(*out.get_pixel(10, 10), pose_color(KPT_COLOR[0]));
    }

    #[test]
    fn test_plot_probs_without_font_keeps_image() {
        let probs = Embedding::new(Array::from_vec(vec![0.2, 0.8]).into_dyn());
        let result = DetectionResult::new(Some(probs), None, None, None);
        let out = Renderer::default().plot(&blank(8, 8), Some(&result), &[]);
        assert_eq!(out.dimensions(), (8, 8));
    }

    #[test]
    fn test_encode_jpeg() {
        let bytes = encode_jpeg(&RgbImage::new(16, 16), 90).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }
}
