//! Five-point face alignment for the encoder.
//!
//! Fits a similarity transform (scale, rotation, translation) from the
//! detected landmarks onto the ArcFace reference layout and warps the face
//! into a 112x112 crop.

use image::{Rgb, RgbImage};

/// Reference landmark positions in a 112x112 ArcFace input.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Returns `None` for degenerate input, e.g. all points coincident.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        // Each pair contributes two rows of A·[a, b, tx, ty] = B:
        //   [sx, -sy, 1, 0] and [sy, sx, 0, 1].
        let mut normal = [[0.0f64; 5]; 4];
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let rows = [
                ([sx as f64, -(sy as f64), 1.0, 0.0], dx as f64),
                ([sy as f64, sx as f64, 0.0, 1.0], dy as f64),
            ];
            for (row, rhs) in rows {
                for i in 0..4 {
                    for j in 0..4 {
                        normal[i][j] += row[i] * row[j];
                    }
                    normal[i][4] += row[i] * rhs;
                }
            }
        }

        let [a, b, tx, ty] = solve(normal)?;
        Some(Self { a: a as f32, b: b as f32, tx: tx as f32, ty: ty as f32 })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Map an output point back into the source image.
    fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Gauss-Jordan elimination with partial pivoting on an augmented 4x5 matrix.
#[allow(clippy::needless_range_loop)]
fn solve(mut m: [[f64; 5]; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot_row][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        for j in col..5 {
            m[col][j] /= pivot;
        }
        for row in 0..4 {
            if row != col {
                let factor = m[row][col];
                for j in col..5 {
                    m[row][j] -= factor * m[col][j];
                }
            }
        }
    }
    Some([m[0][4], m[1][4], m[2][4], m[3][4]])
}

/// Bilinear sample of one pixel; black outside the image.
fn sample(frame: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let px = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            frame.get_pixel(x as u32, y as u32).0.map(f32::from)
        } else {
            [0.0; 3]
        }
    };
    let (p00, p10, p01, p11) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));

    Rgb(std::array::from_fn(|c| {
        let v = p00[c] * (1.0 - fx) * (1.0 - fy) + p10[c] * fx * (1.0 - fy) + p01[c] * (1.0 - fx) * fy + p11[c] * fx * fy;
        v.round().clamp(0.0, 255.0) as u8
    }))
}

/// Warp the face described by `landmarks` into an aligned 112x112 crop.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS)?;
    transform.invert((0.0, 0.0))?;

    Some(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        match transform.invert((ox as f32, oy as f32)) {
            Some((sx, sy)) => sample(frame, sx, sy),
            None => Rgb([0, 0, 0]),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_identity_fit() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_scale_and_shift() {
        let src = REFERENCE_LANDMARKS.map(|(x, y)| (x * 2.0 + 40.0, y * 2.0 + 10.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS).unwrap();
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS.iter()) {
            assert!(close(t.apply(*s), *d, 1e-2));
        }
    }

    #[test]
    fn test_degenerate_landmarks() {
        assert!(Similarity::estimate(&[(5.0, 5.0); 5], &REFERENCE_LANDMARKS).is_none());
        assert!(align_face(&RgbImage::new(10, 10), &[(5.0, 5.0); 5]).is_none());
    }

    #[test]
    fn test_aligned_crop_keeps_color_at_landmark() {
        let src = REFERENCE_LANDMARKS.map(|(x, y)| (x * 1.5 + 30.0, y * 1.5 + 20.0));
        let mut frame = RgbImage::new(260, 240);
        let (lx, ly) = (src[0].0 as u32, src[0].1 as u32);
        for y in ly - 3..=ly + 3 {
            for x in lx - 3..=lx + 3 {
                frame.put_pixel(x, y, Rgb([240, 20, 10]));
            }
        }

        let aligned = align_face(&frame, &src).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        let (rx, ry) = REFERENCE_LANDMARKS[0];
        let Rgb([r, g, _]) = *aligned.get_pixel(rx.round() as u32, ry.round() as u32);
        assert!(r > 150 && g < 60, "got r={r} g={g}");
    }
}
