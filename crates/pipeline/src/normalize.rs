/// Scales `v` to unit length in place. Zero and non-finite magnitudes leave
/// the vector untouched.
pub fn l2_normalize_in_place(v: &mut [f32]) {
    let norm = v.iter().fold(0.0f32, |acc, x| x.mul_add(*x, acc)).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return;
    }
    v.iter_mut().for_each(|x| *x /= norm);
}

/// Cosine similarity of two equal-length vectors.
///
/// Returns `0.0` when either side has zero magnitude or the lengths differ, so a
/// degenerate vector never ranks above a real match.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}
