//! Planar geometry for rectification.
//!
//! Convex hull, minimum-area enclosing rectangle, the 8-unknown homography
//! solve, and the perspective warp. Everything operates on `[x, y]` points
//! in pixel coordinates.

use image::{DynamicImage, Rgb, RgbImage};

pub type Point = [f32; 2];
pub type Quad = [Point; 4];

fn cross(o: Point, a: Point, b: Point) -> f32 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Convex hull via Andrew's monotone chain, counter-clockwise, no
/// duplicate endpoint.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    pts.dedup_by(|a, b| a[0] == b[0] && a[1] == b[1]);
    if pts.len() < 3 {
        return pts;
    }

    let mut hull: Vec<Point> = Vec::with_capacity(pts.len() * 2);
    for &p in &pts {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }
    let lower_len = hull.len() + 1;
    for &p in pts.iter().rev() {
        while hull.len() >= lower_len && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    hull
}

/// Minimum-area enclosing rectangle of a point set, by rotating calipers
/// over the convex hull edges. Corners come back in hull winding order.
pub fn min_area_rect(points: &[Point]) -> Option<Quad> {
    let hull = convex_hull(points);
    if hull.len() < 3 {
        return None;
    }

    let mut best_area = f32::INFINITY;
    let mut best: Option<Quad> = None;

    for i in 0..hull.len() {
        let p1 = hull[i];
        let p2 = hull[(i + 1) % hull.len()];
        let edge = [p2[0] - p1[0], p2[1] - p1[1]];
        let len = edge[0].hypot(edge[1]);
        if len == 0.0 {
            continue;
        }
        let dir = [edge[0] / len, edge[1] / len];
        let normal = [-dir[1], dir[0]];

        let mut min_d = f32::INFINITY;
        let mut max_d = f32::NEG_INFINITY;
        let mut min_n = f32::INFINITY;
        let mut max_n = f32::NEG_INFINITY;
        for &p in &hull {
            let d = p[0] * dir[0] + p[1] * dir[1];
            let n = p[0] * normal[0] + p[1] * normal[1];
            min_d = min_d.min(d);
            max_d = max_d.max(d);
            min_n = min_n.min(n);
            max_n = max_n.max(n);
        }

        let area = (max_d - min_d) * (max_n - min_n);
        if area < best_area {
            best_area = area;
            let corner = |d: f32, n: f32| -> Point {
                [d * dir[0] + n * normal[0], d * dir[1] + n * normal[1]]
            };
            best = Some([
                corner(min_d, min_n),
                corner(max_d, min_n),
                corner(max_d, max_n),
                corner(min_d, max_n),
            ]);
        }
    }
    best
}

/// Reorder quad corners to top-left, top-right, bottom-right, bottom-left.
pub fn order_quad(quad: Quad) -> Quad {
    let mut tl = quad[0];
    let mut tr = quad[0];
    let mut br = quad[0];
    let mut bl = quad[0];
    for &p in &quad {
        let sum = p[0] + p[1];
        let diff = p[0] - p[1];
        if sum < tl[0] + tl[1] {
            tl = p;
        }
        if sum > br[0] + br[1] {
            br = p;
        }
        if diff > tr[0] - tr[1] {
            tr = p;
        }
        if diff < bl[0] - bl[1] {
            bl = p;
        }
    }
    [tl, tr, br, bl]
}

/// Mean of the two horizontal edge lengths of an ordered quad.
pub fn quad_avg_width(q: &Quad) -> f32 {
    (dist(q[0], q[1]) + dist(q[3], q[2])) / 2.0
}

/// Mean of the two vertical edge lengths of an ordered quad.
pub fn quad_avg_height(q: &Quad) -> f32 {
    (dist(q[0], q[3]) + dist(q[1], q[2])) / 2.0
}

fn dist(a: Point, b: Point) -> f32 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

/// Shoelace area of a polygon.
pub fn polygon_area(points: &[Point]) -> f32 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let mut acc = 0.0f32;
    for i in 0..n {
        let j = (i + 1) % n;
        acc += points[i][0] * points[j][1];
        acc -= points[j][0] * points[i][1];
    }
    acc.abs() / 2.0
}

/// 3×3 projective transform, row-major, `h[8] = 1` fixed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography([f64; 9]);

impl Homography {
    /// Solve for the transform mapping each `dst[i]` onto `src[i]`.
    ///
    /// Builds the standard 8×8 linear system with `h22` pinned to 1 and
    /// runs Gaussian elimination with partial pivoting. Returns `None`
    /// only for a singular system (an exactly zero pivot after row
    /// selection), which corresponds to a degenerate quad.
    pub fn solve(dst: &Quad, src: &Quad) -> Option<Self> {
        let mut m = [[0.0f64; 9]; 8];
        for i in 0..4 {
            let (x, y) = (f64::from(dst[i][0]), f64::from(dst[i][1]));
            let (u, v) = (f64::from(src[i][0]), f64::from(src[i][1]));
            m[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
            m[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
        }

        // Forward elimination with partial pivoting.
        for col in 0..8 {
            let pivot_row = (col..8).max_by(|&a, &b| {
                m[a][col].abs().partial_cmp(&m[b][col].abs()).unwrap_or(std::cmp::Ordering::Equal)
            })?;
            if m[pivot_row][col] == 0.0 {
                return None;
            }
            m.swap(col, pivot_row);
            for row in (col + 1)..8 {
                let factor = m[row][col] / m[col][col];
                if factor == 0.0 {
                    continue;
                }
                for k in col..9 {
                    m[row][k] -= factor * m[col][k];
                }
            }
        }

        // Back substitution.
        let mut h = [0.0f64; 9];
        for col in (0..8).rev() {
            let mut acc = m[col][8];
            for k in (col + 1)..8 {
                acc -= m[col][k] * h[k];
            }
            h[col] = acc / m[col][col];
        }
        h[8] = 1.0;
        Some(Self(h))
    }

    /// Apply the transform to a point.
    pub fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let h = &self.0;
        let (x, y) = (f64::from(x), f64::from(y));
        let w = h[6] * x + h[7] * y + h[8];
        if w.abs() < f64::EPSILON {
            return (-1.0, -1.0);
        }
        let u = (h[0] * x + h[1] * y + h[2]) / w;
        let v = (h[3] * x + h[4] * y + h[5]) / w;
        (u as f32, v as f32)
    }
}

/// Warp the quadrilateral `src_quad` of `src` onto an `out_w` × `out_h`
/// rectangle. Each destination pixel is mapped through the homography and
/// bilinearly sampled; samples outside the source are opaque black.
pub fn warp_perspective(
    src: &DynamicImage,
    src_quad: &Quad,
    out_w: u32,
    out_h: u32,
) -> Option<RgbImage> {
    let dst_quad: Quad = [
        [0.0, 0.0],
        [out_w as f32, 0.0],
        [out_w as f32, out_h as f32],
        [0.0, out_h as f32],
    ];
    let h = Homography::solve(&dst_quad, src_quad)?;

    let rgb = src.to_rgb8();
    let mut out = RgbImage::new(out_w, out_h);
    for y in 0..out_h {
        for x in 0..out_w {
            let (sx, sy) = h.project(x as f32 + 0.5, y as f32 + 0.5);
            out.put_pixel(x, y, bilinear_sample(&rgb, sx - 0.5, sy - 0.5));
        }
    }
    Some(out)
}

/// Bilinear sample at a fractional coordinate; out-of-bounds is black.
fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = img.dimensions();
    if x < -1.0 || y < -1.0 || x >= w as f32 || y >= h as f32 {
        return Rgb([0, 0, 0]);
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let sample = |ix: f32, iy: f32| -> [f32; 3] {
        if ix < 0.0 || iy < 0.0 || ix >= w as f32 || iy >= h as f32 {
            [0.0, 0.0, 0.0]
        } else {
            let p = img.get_pixel(ix as u32, iy as u32);
            [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])]
        }
    };

    let p00 = sample(x0, y0);
    let p10 = sample(x0 + 1.0, y0);
    let p01 = sample(x0, y0 + 1.0);
    let p11 = sample(x0 + 1.0, y0 + 1.0);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
