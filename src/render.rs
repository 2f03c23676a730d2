//! Post rendering and image-reference resolution.
//!
//! A post's `images` hold absolute URLs or `/uploads/<file>` paths. The
//! renderer wants something it can open, the browser wants something it can
//! fetch; [`ImageResolver`] maps between the two.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ab_glyph::{point, Font, FontRef, PxScale, ScaleFont};
use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use reqwest::Client;
use tracing::debug;

use crate::models::Post;

pub const UPLOAD_PREFIX: &str = "/uploads/";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("cannot load image {reference}: {message}")]
    Load { reference: String, message: String },
    #[error("cannot decode image {reference}: {message}")]
    Decode { reference: String, message: String },
    #[error("cannot encode card: {0}")]
    Encode(String),
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Renders one post into an image (JPEG bytes for the card renderer).
    async fn render_post(&self, post: &Post) -> Result<Vec<u8>, RenderError>;
}

fn is_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

#[derive(Debug, Clone)]
pub struct ImageResolver {
    upload_dir: PathBuf,
    site_root: String,
}

impl ImageResolver {
    pub fn new(upload_dir: impl AsRef<Path>, site_root: &str) -> Self {
        let dir = upload_dir.as_ref();
        let upload_dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir().map(|cwd| cwd.join(dir)).unwrap_or_else(|_| dir.to_path_buf())
        };
        Self { upload_dir, site_root: site_root.trim_end_matches('/').to_string() }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// `/uploads/<file>` → `<upload_dir>/<file>`; everything else unchanged.
    pub fn for_render(&self, reference: &str) -> String {
        match reference.strip_prefix(UPLOAD_PREFIX) {
            Some(file) if is_plain_file_name(file) => self.upload_dir.join(file).to_string_lossy().into_owned(),
            _ => reference.to_string(),
        }
    }

    /// `/uploads/<file>` → `<site_root>/uploads/<file>`.
    pub fn for_display(&self, reference: &str) -> String {
        if reference.starts_with(UPLOAD_PREFIX) {
            format!("{}{}", self.site_root, reference)
        } else {
            reference.to_string()
        }
    }

    /// Copy of `post` whose images point at renderer-readable locations.
    pub fn resolve_post(&self, post: &Post) -> Post {
        let mut resolved = post.clone();
        resolved.images = post.images.iter().map(|r| self.for_render(r)).collect();
        resolved
    }
}

/// Rejects anything that could step outside the upload directory.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

const CARD_WIDTH: u32 = 720;
const HEADER_HEIGHT: u32 = 96;
const AVATAR_SIZE: u32 = 64;
const PADDING: u32 = 16;
const NAME_PX: f32 = 30.0;
const TEXT_PX: f32 = 26.0;
const MIN_BODY: u32 = 96;
const MAX_SECTION_HEIGHT: u32 = 2400;
const BACKGROUND: Rgb<u8> = Rgb([250, 250, 250]);
const HEADER_INK: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT_INK: Rgb<u8> = Rgb([33, 33, 33]);

static FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

/// Draws a card: a header band with the author's avatar and display name,
/// the wrapped post text, then each post image scaled to the card width.
pub struct CardRenderer {
    http: Client,
}

impl CardRenderer {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self { http: Client::builder().timeout(timeout).build()? })
    }

    async fn load(&self, reference: &str) -> Result<Vec<u8>, RenderError> {
        let fail = |message: String| RenderError::Load { reference: reference.to_string(), message };
        if is_url(reference) {
            let resp = self.http.get(reference).send().await.map_err(|e| fail(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(fail(format!("http {}", resp.status())));
            }
            Ok(resp.bytes().await.map_err(|e| fail(e.to_string()))?.to_vec())
        } else {
            tokio::fs::read(reference).await.map_err(|e| fail(e.to_string()))
        }
    }
}

#[async_trait]
impl Renderer for CardRenderer {
    async fn render_post(&self, post: &Post) -> Result<Vec<u8>, RenderError> {
        let mut sources = Vec::with_capacity(post.images.len());
        for reference in &post.images {
            sources.push((reference.clone(), self.load(reference).await?));
        }
        let avatar = match post.avatar().filter(|_| !post.anon) {
            Some(url) => self.load(&url).await.ok(),
            None => None,
        };
        let card = Card {
            accent: accent_for(post.id),
            name: post.show_name(),
            text: post.text.clone(),
            avatar,
            sources,
        };
        let id = post.id;
        let bytes = tokio::task::spawn_blocking(move || card.compose())
            .await
            .map_err(|e| RenderError::Encode(e.to_string()))??;
        debug!(post_id = id, bytes = bytes.len(), "rendered post card");
        Ok(bytes)
    }
}

fn accent_for(id: i64) -> Rgb<u8> {
    const PALETTE: [[u8; 3]; 4] = [[66, 133, 244], [52, 168, 83], [251, 140, 0], [171, 71, 188]];
    Rgb(PALETTE[id.rem_euclid(PALETTE.len() as i64) as usize])
}

struct Card {
    accent: Rgb<u8>,
    name: String,
    text: String,
    avatar: Option<Vec<u8>>,
    sources: Vec<(String, Vec<u8>)>,
}

impl Card {
    fn compose(self) -> Result<Vec<u8>, RenderError> {
        let font = FontRef::try_from_slice(FONT).map_err(|e| RenderError::Encode(format!("font: {e}")))?;
        let text_scale = PxScale::from(TEXT_PX);
        let line_height = line_height(&font, text_scale);
        let lines = wrap(&font, text_scale, &self.text, (CARD_WIDTH - 2 * PADDING) as f32);

        let mut sections = Vec::with_capacity(self.sources.len());
        for (reference, bytes) in self.sources {
            let img = image::load_from_memory(&bytes)
                .map_err(|e| RenderError::Decode { reference, message: e.to_string() })?;
            sections.push(fit_width(&img, CARD_WIDTH - 2 * PADDING));
        }

        let text_block = if lines.is_empty() { 0 } else { lines.len() as u32 * line_height + PADDING };
        let image_block: u32 = sections.iter().map(|s| s.height() + PADDING).sum();
        let body = (PADDING + text_block + image_block).max(MIN_BODY);
        let mut canvas = RgbImage::from_pixel(CARD_WIDTH, HEADER_HEIGHT + body, BACKGROUND);
        for y in 0..HEADER_HEIGHT {
            for x in 0..CARD_WIDTH {
                canvas.put_pixel(x, y, self.accent);
            }
        }

        // a broken avatar only costs the decoration
        let mut name_x = PADDING;
        if let Some(img) = self.avatar.and_then(|b| image::load_from_memory(&b).ok()) {
            let thumb = img.resize_to_fill(AVATAR_SIZE, AVATAR_SIZE, FilterType::Triangle).to_rgb8();
            let offset = (HEADER_HEIGHT - AVATAR_SIZE) / 2;
            imageops::overlay(&mut canvas, &thumb, offset as i64, offset as i64);
            name_x = offset + AVATAR_SIZE + PADDING;
        }
        let name_scale = PxScale::from(NAME_PX);
        let name_baseline = (HEADER_HEIGHT as f32 + font.as_scaled(name_scale).ascent()) / 2.0 - 2.0;
        draw_line(&mut canvas, &font, name_scale, name_x as f32, name_baseline, &self.name, HEADER_INK);

        let mut y = HEADER_HEIGHT + PADDING;
        let ascent = font.as_scaled(text_scale).ascent();
        for line in &lines {
            draw_line(&mut canvas, &font, text_scale, PADDING as f32, y as f32 + ascent, line, TEXT_INK);
            y += line_height;
        }
        if !lines.is_empty() {
            y += PADDING;
        }

        for section in &sections {
            let x = (CARD_WIDTH - section.width()) / 2;
            imageops::overlay(&mut canvas, section, x as i64, y as i64);
            y += section.height() + PADDING;
        }

        let mut out = Vec::new();
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Jpeg(85))
            .map_err(|e| RenderError::Encode(e.to_string()))?;
        Ok(out)
    }
}

fn line_height(font: &FontRef<'_>, scale: PxScale) -> u32 {
    let scaled = font.as_scaled(scale);
    (scaled.height() + scaled.line_gap()).ceil() as u32
}

/// Breaks `text` into lines no wider than `max_width`, keeping explicit
/// newlines. Breaks at the last space when there is one, otherwise at the
/// character that overflows (CJK text has no spaces).
fn wrap(font: &FontRef<'_>, scale: PxScale, text: &str, max_width: f32) -> Vec<String> {
    let scaled = font.as_scaled(scale);
    let advance = |c: char| scaled.h_advance(font.glyph_id(c));
    let mut lines = Vec::new();
    if text.trim().is_empty() {
        return lines;
    }
    for paragraph in text.trim_end().split('\n') {
        let mut line = String::new();
        let mut width = 0.0;
        for c in paragraph.trim_end_matches('\r').chars() {
            let w = advance(c);
            if width + w > max_width && !line.is_empty() {
                let carry = match line.rfind(' ') {
                    Some(at) if at > 0 && !c.is_whitespace() => line.split_off(at + 1),
                    _ => String::new(),
                };
                lines.push(line.trim_end().to_string());
                width = carry.chars().map(advance).sum();
                line = carry;
                if c == ' ' {
                    continue;
                }
                if width + w > max_width && !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                    width = 0.0;
                }
            }
            line.push(c);
            width += w;
        }
        lines.push(line);
    }
    lines
}

fn draw_line(canvas: &mut RgbImage, font: &FontRef<'_>, scale: PxScale, x: f32, baseline: f32, text: &str, ink: Rgb<u8>) {
    let scaled = font.as_scaled(scale);
    let (width, height) = canvas.dimensions();
    let mut caret = x;
    for c in text.chars() {
        let id = font.glyph_id(c);
        let glyph = id.with_scale_and_position(scale, point(caret, baseline));
        caret += scaled.h_advance(id);
        let Some(outlined) = font.outline_glyph(glyph) else { continue };
        let bounds = outlined.px_bounds();
        outlined.draw(|gx, gy, coverage| {
            let px = bounds.min.x as i64 + gx as i64;
            let py = bounds.min.y as i64 + gy as i64;
            if px < 0 || py < 0 || px >= width as i64 || py >= height as i64 {
                return;
            }
            let pixel = canvas.get_pixel_mut(px as u32, py as u32);
            let a = coverage.clamp(0.0, 1.0);
            for (dst, src) in pixel.0.iter_mut().zip(ink.0) {
                *dst = (*dst as f32 * (1.0 - a) + src as f32 * a).round() as u8;
            }
        });
    }
}

fn fit_width(img: &DynamicImage, width: u32) -> RgbImage {
    if img.width() <= width && img.height() <= MAX_SECTION_HEIGHT {
        return img.to_rgb8();
    }
    img.resize(width, MAX_SECTION_HEIGHT, FilterType::Triangle).to_rgb8()
}
