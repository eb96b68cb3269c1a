/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 26/04/2024
Last Modified: 14/12/2024
License: MIT
*/
use statrs::statistics::{Data, OrderStatistics};

/// Rescales a field to [0, 1] between its low and high percentiles, clipping
/// beyond them. Percentiles rather than the min/max keep single outlier
/// cells from flattening the rest of the map. A field with no percentile
/// spread maps to 0.5. Nodata cells are ignored for the percentiles and
/// propagated to the output.
pub fn normalize(values: &[f64], nodata: f64, p_low: f64, p_high: f64) -> Vec<f64> {
    let valid: Vec<f64> = values
        .iter()
        .filter(|v| **v != nodata && v.is_finite())
        .copied()
        .collect();
    if valid.is_empty() {
        return values.to_vec();
    }
    let mut data = Data::new(valid);
    let low = data.percentile(p_low.round() as usize);
    let high = data.percentile(p_high.round() as usize);
    let spread = high - low;
    values
        .iter()
        .map(|v| {
            if *v == nodata || !v.is_finite() {
                nodata
            } else if spread <= 0f64 {
                0.5
            } else {
                ((v - low) / spread).clamp(0f64, 1f64)
            }
        })
        .collect()
}

/// The flood risk index: beta * normalized cumulative runoff plus
/// (1 - beta) * normalized flow accumulation. Unit-free, in [0, 1].
pub fn risk_index(
    runoff: &[f64],
    accumulation: &[f64],
    nodata: f64,
    beta: f64,
    p_low: f64,
    p_high: f64,
) -> Vec<f64> {
    let q_hat = normalize(runoff, nodata, p_low, p_high);
    let a_hat = normalize(accumulation, nodata, p_low, p_high);
    q_hat
        .iter()
        .zip(a_hat.iter())
        .map(|(q, a)| {
            if *q == nodata || *a == nodata {
                nodata
            } else {
                beta * q + (1f64 - beta) * a
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::{normalize, risk_index};

    const NODATA: f64 = -32768.0;

    #[test]
    fn test_constant_fields_give_half() {
        let q = vec![3.0; 6];
        let a = vec![17.0; 6];
        let r = risk_index(&q, &a, NODATA, 0.5, 5.0, 95.0);
        assert!(r.iter().all(|v| *v == 0.5));
    }

    #[test]
    fn test_normalize_clips_outliers() {
        let mut values: Vec<f64> = (0..99).map(|i| i as f64).collect();
        values.push(1e9);
        let normalized = normalize(&values, NODATA, 5.0, 95.0);
        // the outlier clips to 1 rather than stretching the scale
        assert_eq!(normalized[99], 1.0);
        assert_eq!(normalized[0], 0.0);
        assert!(normalized[50] > 0.3 && normalized[50] < 0.7);
    }

    #[test]
    fn test_normalize_bounds() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let normalized = normalize(&values, NODATA, 5.0, 95.0);
        assert!(normalized.iter().all(|v| *v >= 0.0 && *v <= 1.0));
        assert_eq!(normalized[0], 0.0);
        assert_eq!(normalized[99], 1.0);
        // interior values scale linearly between the percentiles
        assert!(normalized[50] > 0.45 && normalized[50] < 0.55);
    }

    #[test]
    fn test_nodata_propagates() {
        let q = vec![1.0, NODATA, 3.0];
        let a = vec![2.0, 2.0, 2.0];
        let r = risk_index(&q, &a, NODATA, 0.5, 5.0, 95.0);
        assert_eq!(r[1], NODATA);
        assert!(r[0] != NODATA && r[2] != NODATA);
    }

    #[test]
    fn test_beta_weights_components() {
        let q = vec![0.0, 10.0];
        let a = vec![5.0, 5.0];
        // beta = 1 ignores accumulation entirely
        let r = risk_index(&q, &a, NODATA, 1.0, 5.0, 95.0);
        assert_eq!(r[0], 0.0);
        assert_eq!(r[1], 1.0);
    }
}
