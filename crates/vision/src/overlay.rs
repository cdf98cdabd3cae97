//! Transparent overlay with boxes, corner accents and captions, drawn in the
//! session's pixel space.

use image::{ImageEncoder, Rgb, RgbImage, Rgba, RgbaImage, codecs::png::PngEncoder};
use thiserror::Error;
use video_ingest::Resolution;

use crate::{detection::Detection, font::BitmapFont};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("overlay is {overlay} but the frame is {frame}")]
    SizeMismatch {
        overlay: Resolution,
        frame: Resolution,
    },
    #[error("failed to encode overlay: {0}")]
    Encode(#[from] image::ImageError),
}

/// Colours and stroke geometry of the overlay.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverlayStyle {
    pub box_color: Rgba<u8>,
    pub box_width: u32,
    pub accent_color: Rgba<u8>,
    pub accent_width: u32,
    pub accent_length: u32,
    pub label_background: Rgba<u8>,
    pub label_stripe_width: u32,
    pub label_height: u32,
    /// Total horizontal padding added to the measured caption width.
    pub label_padding: u32,
    pub text_color: Rgba<u8>,
    pub text_inset: u32,
    pub text_baseline_gap: u32,
    pub font: BitmapFont,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            box_color: Rgba([0xde, 0x00, 0x00, 0xff]),
            box_width: 3,
            accent_color: Rgba([0x00, 0x9a, 0xda, 0xff]),
            accent_width: 4,
            accent_length: 15,
            label_background: Rgba([0x00, 0x33, 0x99, 0xff]),
            label_stripe_width: 3,
            label_height: 25,
            label_padding: 12,
            text_color: Rgba([0xff, 0xff, 0xff, 0xff]),
            text_inset: 8,
            text_baseline_gap: 8,
            font: BitmapFont::new(2),
        }
    }
}

/// One drawing primitive, in session pixels. Geometry is recorded exactly as
/// derived from the detection; clipping happens only when pixels are written.
#[derive(Clone, Debug, PartialEq)]
pub enum DrawCommand {
    /// Outline centred on the rectangle edges.
    StrokeRect {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        width: u32,
        color: Rgba<u8>,
    },
    /// L-shaped accent with its vertex at `(x, y)`; the arms extend by
    /// `length` towards `dx` horizontally and `dy` vertically (each ±1).
    CornerAccent {
        x: f32,
        y: f32,
        dx: i8,
        dy: i8,
        length: u32,
        width: u32,
        color: Rgba<u8>,
    },
    FillRect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: Rgba<u8>,
    },
    /// Text whose glyph box has its top-left corner at `(x, y)`.
    Text {
        x: f32,
        y: f32,
        text: String,
        color: Rgba<u8>,
    },
}

/// Build the draw list for `detections`, in input order.
pub fn plan(detections: &[Detection], style: &OverlayStyle) -> Vec<DrawCommand> {
    let mut commands = Vec::with_capacity(detections.len() * 8);
    for det in detections {
        let b = det.bbox;
        commands.push(DrawCommand::StrokeRect {
            x1: b.x1,
            y1: b.y1,
            x2: b.x2,
            y2: b.y2,
            width: style.box_width,
            color: style.box_color,
        });

        for (x, y, dx, dy) in [
            (b.x1, b.y1, 1, 1),
            (b.x2, b.y1, -1, 1),
            (b.x1, b.y2, 1, -1),
            (b.x2, b.y2, -1, -1),
        ] {
            commands.push(DrawCommand::CornerAccent {
                x,
                y,
                dx,
                dy,
                length: style.accent_length,
                width: style.accent_width,
                color: style.accent_color,
            });
        }

        let caption = det.caption();
        let label_top = b.y1 - style.label_height as f32;
        commands.push(DrawCommand::FillRect {
            x: b.x1,
            y: label_top,
            width: (style.font.measure(&caption) + style.label_padding) as f32,
            height: style.label_height as f32,
            color: style.label_background,
        });
        commands.push(DrawCommand::FillRect {
            x: b.x1,
            y: label_top,
            width: style.label_stripe_width as f32,
            height: style.label_height as f32,
            color: style.box_color,
        });
        commands.push(DrawCommand::Text {
            x: b.x1 + style.text_inset as f32,
            y: b.y1 - (style.text_baseline_gap + style.font.line_height()) as f32,
            text: caption,
            color: style.text_color,
        });
    }
    commands
}

/// Owns the overlay surface for one session.
///
/// The surface size is fixed at construction to the session resolution, so
/// detection coordinates map 1:1 onto surface pixels.
pub struct OverlayRenderer {
    resolution: Resolution,
    style: OverlayStyle,
    surface: RgbaImage,
    commands: Vec<DrawCommand>,
}

impl OverlayRenderer {
    pub fn new(resolution: Resolution) -> Self {
        Self::with_style(resolution, OverlayStyle::default())
    }

    pub fn with_style(resolution: Resolution, style: OverlayStyle) -> Self {
        Self {
            resolution,
            style,
            surface: RgbaImage::new(resolution.width, resolution.height),
            commands: Vec::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    /// Replace whatever is on the surface with the overlay for `detections`.
    pub fn render(&mut self, detections: &[Detection]) {
        self.clear();
        self.commands = plan(detections, &self.style);
        for command in &self.commands {
            paint(&mut self.surface, &self.style.font, command);
        }
    }

    pub fn clear(&mut self) {
        self.surface.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
        self.commands.clear();
    }

    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn measure_text(&self, text: &str) -> u32 {
        self.style.font.measure(text)
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, OverlayError> {
        encode_png(&self.surface)
    }

    /// Blend the overlay over a frame of the same resolution.
    pub fn composite_onto(&self, frame: &mut RgbImage) -> Result<(), OverlayError> {
        composite(&self.surface, frame)
    }
}

pub fn encode_png(surface: &RgbaImage) -> Result<Vec<u8>, OverlayError> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer).write_image(
        surface.as_raw(),
        surface.width(),
        surface.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(buffer)
}

pub fn composite(surface: &RgbaImage, frame: &mut RgbImage) -> Result<(), OverlayError> {
    if surface.dimensions() != frame.dimensions() {
        return Err(OverlayError::SizeMismatch {
            overlay: Resolution::new(surface.width(), surface.height()),
            frame: Resolution::new(frame.width(), frame.height()),
        });
    }
    for (dst, src) in frame.pixels_mut().zip(surface.pixels()) {
        let alpha = src[3] as u32;
        if alpha == 0 {
            continue;
        }
        let inv = 255 - alpha;
        *dst = Rgb([
            ((src[0] as u32 * alpha + dst[0] as u32 * inv + 127) / 255) as u8,
            ((src[1] as u32 * alpha + dst[1] as u32 * inv + 127) / 255) as u8,
            ((src[2] as u32 * alpha + dst[2] as u32 * inv + 127) / 255) as u8,
        ]);
    }
    Ok(())
}

fn paint(surface: &mut RgbaImage, font: &BitmapFont, command: &DrawCommand) {
    match command {
        DrawCommand::StrokeRect {
            x1,
            y1,
            x2,
            y2,
            width,
            color,
        } => {
            let (x1, y1, x2, y2) = (px(*x1), px(*y1), px(*x2), px(*y2));
            let (lo, hi) = stroke_span(*width);
            fill_rect(surface, x1 - lo, y1 - lo, x2 + hi, y1 + hi, *color);
            fill_rect(surface, x1 - lo, y2 - lo, x2 + hi, y2 + hi, *color);
            fill_rect(surface, x1 - lo, y1 - lo, x1 + hi, y2 + hi, *color);
            fill_rect(surface, x2 - lo, y1 - lo, x2 + hi, y2 + hi, *color);
        }
        DrawCommand::CornerAccent {
            x,
            y,
            dx,
            dy,
            length,
            width,
            color,
        } => {
            let (x, y) = (px(*x), px(*y));
            let (lo, hi) = stroke_span(*width);
            let arm = (*length).min(COORD_LIMIT as u32) as i32;
            let reach_x = x + *dx as i32 * arm;
            let reach_y = y + *dy as i32 * arm;
            fill_rect(
                surface,
                x.min(reach_x) - lo,
                y - lo,
                x.max(reach_x) + hi,
                y + hi,
                *color,
            );
            fill_rect(
                surface,
                x - lo,
                y.min(reach_y) - lo,
                x + hi,
                y.max(reach_y) + hi,
                *color,
            );
        }
        DrawCommand::FillRect {
            x,
            y,
            width,
            height,
            color,
        } => {
            let (left, top) = (px(*x), px(*y));
            let (right, bottom) = (px(*x + *width) - 1, px(*y + *height) - 1);
            fill_rect(surface, left, top, right, bottom, *color);
        }
        DrawCommand::Text { x, y, text, color } => {
            font.rasterize(text, px(*x), px(*y), |gx, gy| {
                blend_pixel(surface, gx, gy, *color)
            });
        }
    }
}

/// Coordinates further off the surface than this all clip the same way.
/// Clamping here keeps stroke and accent offsets far from `i32` overflow.
const COORD_LIMIT: i32 = 1 << 24;

fn px(v: f32) -> i32 {
    v.round().clamp(-COORD_LIMIT as f32, COORD_LIMIT as f32) as i32
}

/// Pixels a stroke of `width` covers before and after its centre line.
fn stroke_span(width: u32) -> (i32, i32) {
    let width = width.clamp(1, 1 << 16) as i32;
    let lo = width / 2;
    (lo, width - 1 - lo)
}

/// Fill the inclusive rectangle, skipping pixels outside the surface.
fn fill_rect(
    surface: &mut RgbaImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgba<u8>,
) {
    let max_x = surface.width() as i32 - 1;
    let max_y = surface.height() as i32 - 1;
    let (left, right) = (left.max(0), right.min(max_x));
    let (top, bottom) = (top.max(0), bottom.min(max_y));
    for y in top..=bottom {
        for x in left..=right {
            blend_pixel(surface, x, y, color);
        }
    }
}

fn blend_pixel(surface: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x < 0 || y < 0 || x >= surface.width() as i32 || y >= surface.height() as i32 {
        return;
    }
    let dst = surface.get_pixel_mut(x as u32, y as u32);
    let sa = color[3] as u32;
    if sa == 255 {
        *dst = color;
        return;
    }
    let da = dst[3] as u32;
    let out_a = sa + da * (255 - sa) / 255;
    if out_a == 0 {
        *dst = Rgba([0, 0, 0, 0]);
        return;
    }
    let mix = |s: u8, d: u8| -> u8 {
        let num = s as u32 * sa * 255 + d as u32 * da * (255 - sa);
        ((num + out_a * 255 / 2) / (out_a * 255)) as u8
    };
    *dst = Rgba([
        mix(color[0], dst[0]),
        mix(color[1], dst[1]),
        mix(color[2], dst[2]),
        out_a as u8,
    ]);
}
