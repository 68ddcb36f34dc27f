//! Composite and live visualisation of fused robot maps.
//!
//! This crate draws layers by declared type only — it never infers room
//! semantics, mirroring the geometric core's own Non-goals. Raster output
//! goes through the `image` crate (the pack's established PNG path);
//! vector output is a small hand-rolled SVG writer since no SVG crate
//! appears anywhere in the pack.

use std::io::Cursor;

use image::{ImageEncoder, Rgb, RgbImage};
use thiserror::Error;
use tudomesh_core::geometry::{AffineMatrix, Point};
use tudomesh_core::map::{EntityType, LayerType, OccupancyMap};
use tudomesh_core::pose::LivePose;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("nothing to draw: no layer pixels or entities across any input map")]
    EmptyCanvas,
    #[error("failed to encode raster image: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const DEFAULT_WALL: Color = Color { r: 40, g: 40, b: 40 };
    pub const FLOOR: Color = Color {
        r: 225,
        g: 225,
        b: 225,
    };
    pub const GRID_LINE: Color = Color {
        r: 200,
        g: 210,
        b: 220,
    };
    pub const CHARGER: Color = Color {
        r: 20,
        g: 160,
        b: 60,
    };

    /// Parses a `#RRGGBB` hex string as used by `vacuums[].color` in config.
    pub fn from_hex(s: &str) -> Option<Color> {
        let s = s.strip_prefix('#')?;
        if s.len() != 6 {
            return None;
        }
        Some(Color {
            r: u8::from_str_radix(&s[0..2], 16).ok()?,
            g: u8::from_str_radix(&s[2..4], 16).ok()?,
            b: u8::from_str_radix(&s[4..6], 16).ok()?,
        })
    }

    fn as_rgb(self) -> Rgb<u8> {
        Rgb([self.r, self.g, self.b])
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Raster,
    Vector,
    Both,
}

#[derive(Debug, Clone, Copy)]
pub enum VectorFormat {
    Svg,
    Png,
}

/// One robot's map, its alignment transform, and its display color, as fed
/// to `render_composite`. Callers should list the reference map first so
/// it draws underneath every other robot's layers.
pub struct MapLayer<'a> {
    pub vacuum_id: &'a str,
    pub map: &'a OccupancyMap,
    pub transform: AffineMatrix,
    pub color: Color,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Visualisation-only grid overlay spacing, in millimetres
    /// (`gridSpacing`). `None` disables the overlay.
    pub grid_spacing_mm: Option<f64>,
    pub margin_px: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            grid_spacing_mm: None,
            margin_px: 8,
        }
    }
}

/// A rendered raster canvas plus the world-grid coordinate mapped to its
/// top-left drawable pixel, so later single-pose overlays (`render_live`)
/// can place a marker at the same scale without recomputing bounds.
pub struct RasterImage {
    img: RgbImage,
    world_min: Point,
    margin_px: u32,
}

impl RasterImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.img.dimensions()
    }

    pub fn world_to_pixel(&self, p: Point) -> (i64, i64) {
        (
            self.margin_px as i64 + (p.x - self.world_min.x).round() as i64,
            self.margin_px as i64 + (p.y - self.world_min.y).round() as i64,
        )
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, RenderError> {
        let mut buffer = Vec::new();
        image::codecs::png::PngEncoder::new(Cursor::new(&mut buffer)).write_image(
            self.img.as_raw(),
            self.img.width(),
            self.img.height(),
            image::ExtendedColorType::Rgb8,
        )?;
        Ok(buffer)
    }

    fn put_disc(&mut self, center_px: (i64, i64), radius: i64, color: Color) {
        let (w, h) = (self.img.width() as i64, self.img.height() as i64);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy > radius * radius {
                    continue;
                }
                let (x, y) = (center_px.0 + dx, center_px.1 + dy);
                if x >= 0 && y >= 0 && x < w && y < h {
                    self.img.put_pixel(x as u32, y as u32, color.as_rgb());
                }
            }
        }
    }
}

/// Vector (SVG) render output.
pub struct VectorDocument(String);

impl VectorDocument {
    pub fn into_string(self) -> String {
        self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct Bounds {
    min: Point,
    max: Point,
}

fn layer_world_points(layer: &MapLayer) -> (Vec<Point>, Vec<Point>) {
    let mut wall = Vec::new();
    let mut floor = Vec::new();
    for l in layer.map.layers_of_type(LayerType::Wall) {
        wall.extend(
            l.pixels
                .iter()
                .map(|c| layer.transform.apply(Point::new(c.x as f64, c.y as f64))),
        );
    }
    for l in layer.map.layers_of_type(LayerType::Floor) {
        floor.extend(
            l.pixels
                .iter()
                .map(|c| layer.transform.apply(Point::new(c.x as f64, c.y as f64))),
        );
    }
    (wall, floor)
}

fn robot_world_point(layer: &MapLayer) -> Option<Point> {
    let (mm, _heading) = layer.map.robot_pose_mm()?;
    let pixel_size = layer.map.pixel_size_mm as f64;
    Some(
        layer
            .transform
            .apply(Point::new(mm.x / pixel_size, mm.y / pixel_size)),
    )
}

fn charger_world_point(layer: &MapLayer) -> Option<Point> {
    let entity = layer
        .map
        .entities_of_type(EntityType::ChargerLocation)
        .next()?;
    let mm = entity.points.first()?;
    let pixel_size = layer.map.pixel_size_mm as f64;
    Some(
        layer
            .transform
            .apply(Point::new(mm.x / pixel_size, mm.y / pixel_size)),
    )
}

fn compute_bounds(layers: &[MapLayer]) -> Option<Bounds> {
    let mut min = Point::new(f64::INFINITY, f64::INFINITY);
    let mut max = Point::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
    let mut seen = false;

    let mut fold = |p: Point| {
        seen = true;
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    };

    for layer in layers {
        let (wall, floor) = layer_world_points(layer);
        wall.iter().chain(floor.iter()).for_each(|p| fold(*p));
        if let Some(p) = robot_world_point(layer) {
            fold(p);
        }
        if let Some(p) = charger_world_point(layer) {
            fold(p);
        }
    }

    seen.then_some(Bounds { min, max })
}

/// Draws every robot's wall/floor pixels into world grid space via its
/// calibration transform, reference layer first, with robot and charger
/// markers overlaid and an optional visualisation grid.
pub fn render_composite(
    layers: &[MapLayer],
    opts: &RenderOptions,
) -> Result<RasterImage, RenderError> {
    let bounds = compute_bounds(layers).ok_or(RenderError::EmptyCanvas)?;

    let width = (bounds.max.x - bounds.min.x).round() as u32 + 1 + 2 * opts.margin_px;
    let height = (bounds.max.y - bounds.min.y).round() as u32 + 1 + 2 * opts.margin_px;

    let mut image = RasterImage {
        img: RgbImage::from_pixel(width, height, Rgb([255, 255, 255])),
        world_min: bounds.min,
        margin_px: opts.margin_px,
    };

    if let Some(spacing_mm) = opts.grid_spacing_mm {
        draw_grid(&mut image, layers, spacing_mm);
    }

    for layer in layers {
        let (wall, floor) = layer_world_points(layer);
        for p in &floor {
            let (x, y) = image.world_to_pixel(*p);
            set_pixel(&mut image.img, x, y, Color::FLOOR);
        }
        for p in &wall {
            let (x, y) = image.world_to_pixel(*p);
            set_pixel(&mut image.img, x, y, layer.color);
        }
        if let Some(p) = charger_world_point(layer) {
            let px = image.world_to_pixel(p);
            image.put_disc(px, 2, Color::CHARGER);
        }
        if let Some(p) = robot_world_point(layer) {
            let px = image.world_to_pixel(p);
            image.put_disc(px, 3, layer.color);
        }
    }

    Ok(image)
}

fn draw_grid(image: &mut RasterImage, layers: &[MapLayer], spacing_mm: f64) {
    let Some(reference) = layers.first() else {
        return;
    };
    let spacing_grid = spacing_mm / reference.map.pixel_size_mm as f64;
    if spacing_grid <= 0.0 {
        return;
    }
    let (w, h) = image.img.dimensions();
    let mut world_x = (image.world_min.x / spacing_grid).floor() * spacing_grid;
    while world_x <= image.world_min.x + w as f64 {
        let (px, _) = image.world_to_pixel(Point::new(world_x, 0.0));
        if px >= 0 && (px as u32) < w {
            for y in 0..h {
                image
                    .img
                    .put_pixel(px as u32, y, Color::GRID_LINE.as_rgb());
            }
        }
        world_x += spacing_grid;
    }
    let mut world_y = (image.world_min.y / spacing_grid).floor() * spacing_grid;
    while world_y <= image.world_min.y + h as f64 {
        let (_, py) = image.world_to_pixel(Point::new(0.0, world_y));
        if py >= 0 && (py as u32) < h {
            for x in 0..w {
                image
                    .img
                    .put_pixel(x, py as u32, Color::GRID_LINE.as_rgb());
            }
        }
        world_y += spacing_grid;
    }
}

fn set_pixel(img: &mut RgbImage, x: i64, y: i64, color: Color) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color.as_rgb());
    }
}

/// Renders a single robot's pose, overlaid on `background` if given
/// (reusing its world-to-pixel scale) or on a small standalone canvas
/// centred on the pose otherwise. Used by the HTTP `/render` endpoint for
/// cheap per-robot polling without recomposing the full mosaic.
pub fn render_live(pose: &LivePose, background: Option<&RasterImage>) -> RasterImage {
    const STANDALONE_HALF_EXTENT: f64 = 64.0;
    const MARGIN_PX: u32 = 8;

    let mut image = match background {
        Some(bg) => RasterImage {
            img: bg.img.clone(),
            world_min: bg.world_min,
            margin_px: bg.margin_px,
        },
        None => RasterImage {
            img: RgbImage::from_pixel(
                (2.0 * STANDALONE_HALF_EXTENT) as u32 + 2 * MARGIN_PX,
                (2.0 * STANDALONE_HALF_EXTENT) as u32 + 2 * MARGIN_PX,
                Rgb([255, 255, 255]),
            ),
            world_min: Point::new(pose.x - STANDALONE_HALF_EXTENT, pose.y - STANDALONE_HALF_EXTENT),
            margin_px: MARGIN_PX,
        },
    };

    let px = image.world_to_pixel(Point::new(pose.x, pose.y));
    image.put_disc(px, 4, Color::DEFAULT_WALL);

    let heading_rad = pose.heading_deg.to_radians();
    let tip = (
        px.0 + (heading_rad.cos() * 10.0).round() as i64,
        px.1 + (heading_rad.sin() * 10.0).round() as i64,
    );
    image.put_disc(tip, 1, Color::DEFAULT_WALL);

    image
}

/// Builds an SVG document equivalent to `render_composite`'s raster output.
pub fn render_composite_vector(
    layers: &[MapLayer],
    opts: &RenderOptions,
) -> Result<VectorDocument, RenderError> {
    let bounds = compute_bounds(layers).ok_or(RenderError::EmptyCanvas)?;
    let margin = opts.margin_px as f64;
    let width = bounds.max.x - bounds.min.x + 1.0 + 2.0 * margin;
    let height = bounds.max.y - bounds.min.y + 1.0 + 2.0 * margin;

    let to_svg = |p: Point| (p.x - bounds.min.x + margin, p.y - bounds.min.y + margin);

    let mut svg = String::new();
    svg.push_str(&format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{width}\" height=\"{height}\" viewBox=\"0 0 {width} {height}\">\n",
    ));
    svg.push_str(&format!(
        "<rect x=\"0\" y=\"0\" width=\"{width}\" height=\"{height}\" fill=\"#ffffff\"/>\n"
    ));

    for layer in layers {
        let (wall, floor) = layer_world_points(layer);
        for p in &floor {
            let (x, y) = to_svg(*p);
            svg.push_str(&format!(
                "<rect x=\"{x}\" y=\"{y}\" width=\"1\" height=\"1\" fill=\"#{:02x}{:02x}{:02x}\"/>\n",
                Color::FLOOR.r, Color::FLOOR.g, Color::FLOOR.b,
            ));
        }
        for p in &wall {
            let (x, y) = to_svg(*p);
            svg.push_str(&format!(
                "<rect x=\"{x}\" y=\"{y}\" width=\"1\" height=\"1\" fill=\"#{:02x}{:02x}{:02x}\"/>\n",
                layer.color.r, layer.color.g, layer.color.b,
            ));
        }
        if let Some(p) = robot_world_point(layer) {
            let (x, y) = to_svg(p);
            svg.push_str(&format!(
                "<circle cx=\"{x}\" cy=\"{y}\" r=\"3\" fill=\"#{:02x}{:02x}{:02x}\"/>\n",
                layer.color.r, layer.color.g, layer.color.b,
            ));
        }
        if let Some(p) = charger_world_point(layer) {
            let (x, y) = to_svg(p);
            svg.push_str(&format!(
                "<circle cx=\"{x}\" cy=\"{y}\" r=\"2\" fill=\"#{:02x}{:02x}{:02x}\"/>\n",
                Color::CHARGER.r, Color::CHARGER.g, Color::CHARGER.b,
            ));
        }
    }

    svg.push_str("</svg>\n");
    Ok(VectorDocument(svg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tudomesh_core::map::{Cell, Entity, EntityType, GridSize, Layer, MmPoint};

    fn square_map(side: i32) -> OccupancyMap {
        let mut pixels = Vec::new();
        for x in 0..side {
            for y in 0..side {
                if x == 0 || y == 0 || x == side - 1 || y == side - 1 {
                    pixels.push(Cell::new(x, y));
                }
            }
        }
        OccupancyMap {
            size: GridSize {
                width: side as u32,
                height: side as u32,
            },
            pixel_size_mm: 10,
            layers: vec![Layer {
                layer_type: LayerType::Wall,
                pixels,
                metadata: serde_json::Value::Null,
            }],
            entities: vec![Entity {
                entity_type: EntityType::RobotPosition,
                points: vec![MmPoint { x: 50.0, y: 50.0 }],
                metadata: serde_json::json!({"angle": 0.0}),
            }],
        }
    }

    #[test]
    fn render_composite_rejects_empty_input() {
        let err = render_composite(&[], &RenderOptions::default()).unwrap_err();
        assert!(matches!(err, RenderError::EmptyCanvas));
    }

    #[test]
    fn render_composite_produces_canvas_sized_to_content() {
        let map = square_map(10);
        let layers = vec![MapLayer {
            vacuum_id: "robotA",
            map: &map,
            transform: AffineMatrix::IDENTITY,
            color: Color::DEFAULT_WALL,
        }];
        let image = render_composite(&layers, &RenderOptions::default()).unwrap();
        let (w, h) = image.dimensions();
        assert_eq!(w, 10 + 1 + 16);
        assert_eq!(h, 10 + 1 + 16);
    }

    #[test]
    fn render_composite_encodes_valid_png() {
        let map = square_map(5);
        let layers = vec![MapLayer {
            vacuum_id: "robotA",
            map: &map,
            transform: AffineMatrix::IDENTITY,
            color: Color::DEFAULT_WALL,
        }];
        let image = render_composite(&layers, &RenderOptions::default()).unwrap();
        let png = image.encode_png().unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn render_composite_vector_emits_svg_header() {
        let map = square_map(5);
        let layers = vec![MapLayer {
            vacuum_id: "robotA",
            map: &map,
            transform: AffineMatrix::IDENTITY,
            color: Color::DEFAULT_WALL,
        }];
        let doc = render_composite_vector(&layers, &RenderOptions::default()).unwrap();
        assert!(doc.as_str().starts_with("<svg"));
        assert!(doc.as_str().trim_end().ends_with("</svg>"));
    }

    #[test]
    fn render_live_without_background_centres_on_pose() {
        let pose = LivePose {
            vacuum_id: "robotA".into(),
            x: 100.0,
            y: 200.0,
            heading_deg: 0.0,
        };
        let image = render_live(&pose, None);
        assert!(image.dimensions().0 > 0);
    }

    #[test]
    fn color_from_hex_parses_rrggbb() {
        let color = Color::from_hex("#ff00aa").unwrap();
        assert_eq!(color, Color { r: 255, g: 0, b: 0xaa });
    }

    #[test]
    fn color_from_hex_rejects_malformed_input() {
        assert!(Color::from_hex("ff00aa").is_none());
        assert!(Color::from_hex("#ff00").is_none());
    }
}
