//! Five-point face alignment.
//!
//! Fits a similarity transform (uniform scale, rotation, translation) that
//! carries the detected landmarks onto a fixed template, then resamples the
//! frame through its inverse into a square RGB crop for the encoder.

/// Template landmarks for a 112×112 crop: eyes, nose tip, mouth corners.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Template landmarks scaled to an `out_size`×`out_size` crop.
pub fn reference_landmarks(out_size: usize) -> [(f32, f32); 5] {
    let s = out_size as f32 / 112.0;
    TEMPLATE_112.map(|(x, y)| (x * s, y * s))
}

/// `p' = [a -b; b a] p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Similarity = Similarity {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Closed-form least-squares fit mapping `src` onto `dst`.
    ///
    /// Degenerate input (all source points coincident) yields the identity.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Similarity {
        let n = src.len().min(dst.len());
        if n == 0 {
            return Self::IDENTITY;
        }

        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n]
                .iter()
                .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst).take(n) {
            let (px, py) = (sx - msx, sy - msy);
            let (qx, qy) = (dx - mdx, dy - mdy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            norm += px * px + py * py;
        }

        if norm < 1e-12 {
            return Self::IDENTITY;
        }

        let a = dot / norm;
        let b = cross / norm;
        Similarity {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Uniform scale factor.
    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    pub fn inverse(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Similarity {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear sample of channel `c` at a fractional position; black outside.
fn sample_rgb(rgb: &[u8], width: usize, height: usize, (x, y): (f32, f32), c: usize) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let at = |xi: f32, yi: f32| -> f32 {
        if xi < 0.0 || yi < 0.0 || xi >= width as f32 || yi >= height as f32 {
            return 0.0;
        }
        rgb.get((yi as usize * width + xi as usize) * 3 + c)
            .copied()
            .unwrap_or(0) as f32
    };

    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1.0, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1.0) * (1.0 - fx) * fy
        + at(x0 + 1.0, y0 + 1.0) * fx * fy
}

/// Align a detected face to a canonical `out_size`×`out_size` RGB crop.
pub fn align_face(
    rgb: &[u8],
    width: u32,
    height: u32,
    landmarks: &[(f32, f32); 5],
    out_size: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; out_size * out_size * 3];

    let forward = Similarity::estimate(landmarks, &reference_landmarks(out_size));
    let Some(back) = forward.inverse() else {
        return out;
    };

    let (w, h) = (width as usize, height as usize);
    for oy in 0..out_size {
        for ox in 0..out_size {
            let src = back.apply((ox as f32, oy as f32));
            let base = (oy * out_size + ox) * 3;
            for c in 0..3 {
                out[base + c] = sample_rgb(rgb, w, h, src, c).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_identity_fit() {
        let t = Similarity::estimate(&TEMPLATE_112, &TEMPLATE_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_reference() {
        let r = reference_landmarks(224);
        assert!((r[0].0 - 76.5892).abs() < 1e-3);
        assert!((r[4].1 - 184.4082).abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_rotation_and_scale() {
        // 90° rotation, scale 2, shift (10, -5).
        let known = Similarity { a: 0.0, b: 2.0, tx: 10.0, ty: -5.0 };
        let dst: Vec<(f32, f32)> = TEMPLATE_112.iter().map(|&p| known.apply(p)).collect();
        let fit = Similarity::estimate(&TEMPLATE_112, &dst);
        assert!((fit.a - known.a).abs() < 1e-3, "a = {}", fit.a);
        assert!((fit.b - known.b).abs() < 1e-3, "b = {}", fit.b);
        assert!((fit.scale() - 2.0).abs() < 1e-3);
        assert!(close(fit.apply(TEMPLATE_112[2]), dst[2], 1e-2));
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = Similarity { a: 0.8, b: -0.3, tx: 12.0, ty: 4.0 };
        let inv = t.inverse().unwrap();
        let p = (33.0, 71.0);
        assert!(close(inv.apply(t.apply(p)), p, 1e-3));
    }

    #[test]
    fn test_degenerate_points_give_identity() {
        let src = [(5.0, 5.0); 5];
        assert_eq!(Similarity::estimate(&src, &TEMPLATE_112), Similarity::IDENTITY);
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = vec![128u8; 640 * 480 * 3];
        let aligned = align_face(&frame, 640, 480, &reference_landmarks(150), 150);
        assert_eq!(aligned.len(), 150 * 150 * 3);
    }

    #[test]
    fn test_landmark_lands_on_template_per_channel() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h * 3];

        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // Pure green patch on the left eye.
        let (lx, ly) = (src_landmarks[0].0 as usize, src_landmarks[0].1 as usize);
        for py in ly - 2..=ly + 2 {
            for px in lx - 2..=lx + 2 {
                frame[(py * w + px) * 3 + 1] = 255;
            }
        }

        let out = 112;
        let aligned = align_face(&frame, w as u32, h as u32, &src_landmarks, out);

        let ref_x = TEMPLATE_112[0].0.round() as usize;
        let ref_y = TEMPLATE_112[0].1.round() as usize;
        let (mut green, mut other) = (0u8, 0u8);
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                let px = &aligned[(y * out + x) * 3..(y * out + x) * 3 + 3];
                green = green.max(px[1]);
                other = other.max(px[0]).max(px[2]);
            }
        }
        assert!(green > 100, "expected green near ({ref_x}, {ref_y}), max={green}");
        assert_eq!(other, 0);
    }
}
