use num_complex::Complex;

/// Median of the finite values, averaging the two middle values for even counts.
pub fn nan_median<I>(values: I) -> Option<f32>
where
    I: IntoIterator<Item = f32>,
{
    let mut finite: Vec<f32> = values.into_iter().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(|a, b| a.total_cmp(b));
    let mid = finite.len() / 2;
    if finite.len() % 2 == 0 {
        Some(((finite[mid - 1] as f64 + finite[mid] as f64) / 2.0) as f32)
    } else {
        Some(finite[mid])
    }
}

pub fn nan_mean<I>(values: I) -> Option<f32>
where
    I: IntoIterator<Item = f32>,
{
    let (sum, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0f64, 0usize), |(s, n), v| (s + v as f64, n + 1));
    if count == 0 {
        None
    } else {
        Some((sum / count as f64) as f32)
    }
}

/// Root mean square of the finite values.
pub fn nan_rms<I>(values: I) -> Option<f32>
where
    I: IntoIterator<Item = f32>,
{
    let (sum_sq, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0f64, 0usize), |(s, n), v| (s + (v as f64).powi(2), n + 1));
    if count == 0 {
        None
    } else {
        Some((sum_sq / count as f64).sqrt() as f32)
    }
}

/// Wraps a phase into (-pi, pi] through the unit phasor.
pub fn wrap_phase(value: f32) -> f32 {
    Complex::from_polar(1.0f32, value).arg()
}
