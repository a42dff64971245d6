//! Passive membrane properties: series and input resistance from the
//! hyperpolarizing steps, and the membrane time constant from a
//! two-component exponential fit to the averaged step transient.

use ndarray::{Array1, Array2};

use crate::interval::Interval;
use crate::steps::StepMeans;
use crate::units::megaohms;

/// Amplitudes below this (mV) do not count as a fit component.
const AMP_EPS: f64 = 1e-3;
const MAX_ITER: usize = 200;
const LAMBDA_MAX: f64 = 1e12;

#[derive(Clone, Copy, Debug)]
pub struct PassiveParams {
    /// Pre-step baseline window (ms).
    pub baseline_window_ms: f64,
    /// Offset of the single post-transition sample used for the
    /// instantaneous resistance (ms).
    pub rs_offset_ms: f64,
}

impl Default for PassiveParams {
    fn default() -> Self {
        Self {
            baseline_window_ms: 10.0,
            rs_offset_ms: 0.5,
        }
    }
}

/// Instantaneous (non-steady-state) resistance at a step transition, in
/// MΩ: the ratio of the voltage drop to the current drop between a
/// pre-step baseline window and a single sample a fixed offset into the
/// step. `None` when the baseline window is spike-contaminated, falls off
/// the trace, or the current does not actually step.
pub fn series_resistance(
    voltage_mv: &[f64],
    current_pa: &[f64],
    sampling_rate: f64,
    step_start: usize,
    events_s: &[f64],
    params: &PassiveParams,
) -> Option<f64> {
    let pre_len = (params.baseline_window_ms / 1e3 * sampling_rate).round() as usize;
    let pre_start = step_start.checked_sub(pre_len)?;
    let pre = Interval::new(pre_start, step_start, 1.0 / sampling_rate).ok()?;
    let v0 = pre.mean_of(voltage_mv, Some(events_s))?;
    let i0 = pre.mean_of(current_pa, Some(events_s))?;
    let offset = step_start + (params.rs_offset_ms / 1e3 * sampling_rate).round() as usize;
    let v1 = *voltage_mv.get(offset)?;
    let i1 = *current_pa.get(offset)?;
    let di = i1 - i0;
    if di.abs() < 1e-9 {
        return None;
    }
    Some(megaohms(v1 - v0, di))
}

/// Steady-state ΔV/ΔI between two step means, in MΩ. `None` when either
/// mean is undefined or the current levels coincide.
pub fn membrane_resistance(means: &StepMeans, a: usize, b: usize) -> Option<f64> {
    let v1 = means.voltage.get(a).copied()??;
    let i1 = means.current.get(a).copied()??;
    let v2 = means.voltage.get(b).copied()??;
    let i2 = means.current.get(b).copied()??;
    let di = i2 - i1;
    if di.abs() < 1e-9 {
        return None;
    }
    Some(megaohms(v2 - v1, di))
}

/// Result of the exponential fit to the averaged hyperpolarization
/// transient.
#[derive(Clone, Copy, Debug)]
pub struct ExpFit {
    /// Membrane charging time constant (ms): the faster fit component with
    /// positive amplitude.
    pub tau_ms: f64,
    /// Root-mean-square fit residual (mV).
    pub residual: f64,
}

/// Fit `y(t) = a0 + a1 exp(-t/tau1) + a2 exp(-t/tau2)` to the averaged
/// step trace and select the membrane time constant. `None` on
/// convergence failure or when no component has positive amplitude; this
/// is an expected outcome for flat or pathological transients, not an
/// error.
pub fn fit_membrane_time_constant(trace_mv: &[f64], sampling_rate: f64) -> Option<ExpFit> {
    let period_ms = 1e3 / sampling_rate;
    let (p, residual) = fit_two_exponentials(trace_mv, period_ms)?;
    let mut components = [(p[1], p[2]), (p[3], p[4])];
    components.sort_by(|a, b| a.1.total_cmp(&b.1));
    let tau_ms = components
        .iter()
        .find(|(amp, _)| *amp > AMP_EPS)
        .map(|(_, tau)| *tau)?;
    Some(ExpFit { tau_ms, residual })
}

/// Levenberg-Marquardt fit of the two-component decay. Returns the
/// parameters [a0, a1, tau1, a2, tau2] and the RMS residual.
fn fit_two_exponentials(y: &[f64], period_ms: f64) -> Option<([f64; 5], f64)> {
    let n = y.len();
    if n < 10 || !y.iter().all(|v| v.is_finite()) {
        return None;
    }
    let t: Vec<f64> = (0..n).map(|k| k as f64 * period_ms).collect();
    let tail = &y[n - n / 10 - 1..];
    let a0 = tail.iter().sum::<f64>() / tail.len() as f64;
    let amp = y[0] - a0;
    let total_ms = t[n - 1];
    let tau_floor = period_ms / 10.0;
    let mut p = [a0, 0.8 * amp, total_ms / 10.0, 0.2 * amp, total_ms / 2.0];
    let mut sse = sum_squared_error(y, &t, &p);
    let mut lambda = 1e-3;

    for _ in 0..MAX_ITER {
        let mut jacobian = Array2::<f64>::zeros((n, 5));
        let mut residual = Array1::<f64>::zeros(n);
        for k in 0..n {
            let e1 = (-t[k] / p[2]).exp();
            let e2 = (-t[k] / p[4]).exp();
            jacobian[[k, 0]] = 1.0;
            jacobian[[k, 1]] = e1;
            jacobian[[k, 2]] = p[1] * t[k] / (p[2] * p[2]) * e1;
            jacobian[[k, 3]] = e2;
            jacobian[[k, 4]] = p[3] * t[k] / (p[4] * p[4]) * e2;
            residual[k] = y[k] - (p[0] + p[1] * e1 + p[3] * e2);
        }
        let jtj = jacobian.t().dot(&jacobian);
        let jtr = jacobian.t().dot(&residual);
        let mut damped = jtj.clone();
        for k in 0..5 {
            damped[[k, k]] += lambda * jtj[[k, k]].max(1e-8);
        }
        let Some(delta) = solve(&damped, &jtr) else {
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                return None;
            }
            continue;
        };
        let mut candidate = p;
        for k in 0..5 {
            candidate[k] += delta[k];
        }
        candidate[2] = candidate[2].max(tau_floor);
        candidate[4] = candidate[4].max(tau_floor);
        let candidate_sse = sum_squared_error(y, &t, &candidate);
        if candidate_sse.is_finite() && candidate_sse < sse {
            let improved = sse - candidate_sse;
            p = candidate;
            sse = candidate_sse;
            lambda = (lambda * 0.3).max(1e-12);
            if improved <= 1e-12 * sse.max(1e-12) {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                return None;
            }
        }
    }
    if !sse.is_finite() {
        return None;
    }
    Some((p, (sse / n as f64).sqrt()))
}

fn sum_squared_error(y: &[f64], t: &[f64], p: &[f64; 5]) -> f64 {
    y.iter()
        .zip(t)
        .map(|(&yk, &tk)| {
            let model = p[0] + p[1] * (-tk / p[2]).exp() + p[3] * (-tk / p[4]).exp();
            let r = yk - model;
            r * r
        })
        .sum()
}

/// Solve the 5x5 normal system by Gaussian elimination with partial
/// pivoting. `None` when the system is singular.
fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let mut m = Array2::<f64>::zeros((n, n + 1));
    for r in 0..n {
        for c in 0..n {
            m[[r, c]] = a[[r, c]];
        }
        m[[r, n]] = b[r];
    }
    for col in 0..n {
        let mut pivot = col;
        for r in col + 1..n {
            if m[[r, col]].abs() > m[[pivot, col]].abs() {
                pivot = r;
            }
        }
        if m[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for c in 0..=n {
                let tmp = m[[col, c]];
                m[[col, c]] = m[[pivot, c]];
                m[[pivot, c]] = tmp;
            }
        }
        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = m[[r, col]] / m[[col, col]];
            for c in col..=n {
                m[[r, c]] -= factor * m[[col, c]];
            }
        }
    }
    Some(Array1::from_iter((0..n).map(|i| m[[i, n]] / m[[i, i]])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const RATE: f64 = 10_000.0;

    #[test]
    fn series_resistance_is_positive_for_a_hyperpolarizing_step() {
        // baseline at -70 mV / 0 pA, step to -50 pA at sample 2000 with an
        // exponential relaxation toward -80 mV (tau 20 ms)
        let n = 5000;
        let step = 2000;
        let mut v = vec![-70.0; n];
        let mut i = vec![0.0; n];
        for k in step..n {
            let t_ms = (k - step) as f64 / RATE * 1e3;
            v[k] = -80.0 + 10.0 * (-t_ms / 20.0).exp();
            i[k] = -50.0;
        }
        let rs = series_resistance(&v, &i, RATE, step, &[], &PassiveParams::default()).unwrap();
        assert!(rs > 0.0, "Rs = {rs}");
        // the 0.5 ms sample has barely relaxed, so Rs is well below Rm
        assert!(rs < 100.0, "Rs = {rs}");
    }

    #[test]
    fn series_resistance_requires_a_clean_baseline() {
        let v = vec![-70.0; 5000];
        let i = vec![0.0; 5000];
        // event inside the 10 ms pre-step window before sample 2000
        let events = [0.195];
        assert_eq!(
            series_resistance(&v, &i, RATE, 2000, &events, &PassiveParams::default()),
            None
        );
    }

    #[test]
    fn membrane_resistance_from_step_means() {
        let means = StepMeans {
            current: vec![Some(0.0), Some(50.0), Some(-50.0), Some(-100.0)],
            voltage: vec![Some(-70.0), Some(-60.0), Some(-80.0), Some(-90.0)],
        };
        // baseline -> first hyperpolarization: -10 mV / -50 pA = 200 MOhm
        let rm = membrane_resistance(&means, 0, 2).unwrap();
        assert!((rm - 200.0).abs() < 1e-9);
        assert_eq!(membrane_resistance(&means, 0, 4), None);
        let undefined = StepMeans {
            current: vec![Some(0.0), None],
            voltage: vec![Some(-70.0), Some(-80.0)],
        };
        assert_eq!(membrane_resistance(&undefined, 0, 1), None);
    }

    #[test]
    fn fit_recovers_a_known_time_constant() {
        let mut rng = StdRng::seed_from_u64(10024);
        let tau = 20.0;
        let y: Vec<f64> = (0..3000)
            .map(|k| {
                let t_ms = k as f64 / RATE * 1e3;
                -80.0 + 10.0 * (-t_ms / tau).exp() + rng.gen_range(-0.05..0.05)
            })
            .collect();
        let fit = fit_membrane_time_constant(&y, RATE).unwrap();
        assert!(
            (fit.tau_ms - tau).abs() / tau < 0.1,
            "tau = {}",
            fit.tau_ms
        );
        assert!(fit.residual < 0.1);
    }

    #[test]
    fn flat_transient_does_not_fit() {
        let y = vec![-70.0; 3000];
        assert!(fit_membrane_time_constant(&y, RATE).is_none());
    }
}
