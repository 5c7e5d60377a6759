//! Continuous distributions used to model action latencies.

use std::f64::consts::{PI, SQRT_2};

/// A continuous probability distribution over latencies in seconds.
pub trait Distribution: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn cdf(&self, x: f64) -> f64;

    fn pdf(&self, x: f64) -> f64;

    /// Smallest `x` with `cdf(x) >= p`, for `p` in `(0, 1)`.
    ///
    /// The default brackets the answer by doubling and bisects the CDF.
    fn quantile(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 1.0);
        let mut low = -1.0;
        let mut high = 1.0;
        for _ in 0..1_024 {
            if self.cdf(low) < p {
                break;
            }
            low *= 2.0;
        }
        for _ in 0..1_024 {
            if self.cdf(high) >= p {
                break;
            }
            high *= 2.0;
        }
        for _ in 0..200 {
            let middle = 0.5 * (low + high);
            if self.cdf(middle) < p {
                low = middle;
            } else {
                high = middle;
            }
        }
        high
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uniform {
    pub low: f64,
    pub high: f64,
}

impl Uniform {
    #[must_use]
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            low: low.min(high),
            high: low.max(high),
        }
    }

    fn width(&self) -> f64 {
        self.high - self.low
    }
}

impl Distribution for Uniform {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn cdf(&self, x: f64) -> f64 {
        if x >= self.high {
            1.0
        } else if x <= self.low {
            0.0
        } else {
            (x - self.low) / self.width()
        }
    }

    fn pdf(&self, x: f64) -> f64 {
        if self.width() > 0.0 && (self.low..=self.high).contains(&x) {
            1.0 / self.width()
        } else {
            0.0
        }
    }

    fn quantile(&self, p: f64) -> f64 {
        self.low + p.clamp(0.0, 1.0) * self.width()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normal {
    pub mean: f64,
    pub std_dev: f64,
}

impl Distribution for Normal {
    fn name(&self) -> &'static str {
        "normal"
    }

    fn cdf(&self, x: f64) -> f64 {
        0.5 * (1.0 + erf((x - self.mean) / (self.std_dev * SQRT_2)))
    }

    fn pdf(&self, x: f64) -> f64 {
        let z = (x - self.mean) / self.std_dev;
        (-0.5 * z * z).exp() / (self.std_dev * (2.0 * PI).sqrt())
    }
}

/// Gamma distribution with `shape` k and `scale` θ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gamma {
    pub shape: f64,
    pub scale: f64,
}

impl Distribution for Gamma {
    fn name(&self) -> &'static str {
        "gamma"
    }

    fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        regularized_lower_gamma(self.shape, x / self.scale)
    }

    fn pdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        let log_density =
            (self.shape - 1.0) * x.ln() - x / self.scale - ln_gamma(self.shape) - self.shape * self.scale.ln();
        log_density.exp()
    }
}

/// Type I generalized logistic distribution (skewed logistic).
///
/// `cdf(x) = (1 + exp(-z))^-shape` with `z = (x - loc) / scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenLogistic {
    pub shape: f64,
    pub loc: f64,
    pub scale: f64,
}

impl GenLogistic {
    fn z(&self, x: f64) -> f64 {
        (x - self.loc) / self.scale
    }

    /// Log density, stable for large `|z|`.
    pub(super) fn ln_pdf(&self, x: f64) -> f64 {
        let z = self.z(x);
        // ln(1 + e^-z) without overflow
        let softplus = if z > 0.0 { (-z).exp().ln_1p() } else { -z + z.exp().ln_1p() };
        self.shape.ln() - z - (self.shape + 1.0) * softplus - self.scale.ln()
    }
}

impl Distribution for GenLogistic {
    fn name(&self) -> &'static str {
        "genlogistic"
    }

    fn cdf(&self, x: f64) -> f64 {
        (1.0 + (-self.z(x)).exp()).powf(-self.shape)
    }

    fn pdf(&self, x: f64) -> f64 {
        self.ln_pdf(x).exp()
    }

    fn quantile(&self, p: f64) -> f64 {
        let p = p.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
        self.loc - self.scale * (p.powf(-1.0 / self.shape) - 1.0).ln()
    }
}

/// Error function, Abramowitz and Stegun 7.1.26.
#[must_use]
pub fn erf(x: f64) -> f64 {
    const A: [f64; 5] = [0.254_829_592, -0.284_496_736, 1.421_413_741, -1.453_152_027, 1.061_405_429];
    const P: f64 = 0.327_591_1;

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

/// `ln Γ(x)` for `x > 0`, Lanczos approximation.
#[must_use]
pub fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        // reflection
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut sum = COEFFICIENTS[0];
    let mut offset = 0.0;
    for c in &COEFFICIENTS[1..] {
        offset += 1.0;
        sum += c / (x + offset);
    }
    let t = x + G + 0.5;
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

/// Regularized lower incomplete gamma `P(a, x)`.
///
/// Series expansion below `a + 1`, continued fraction above.
#[must_use]
pub fn regularized_lower_gamma(a: f64, x: f64) -> f64 {
    const EPS: f64 = 1e-14;
    const MAX_ITER: usize = 500;

    if x <= 0.0 {
        return 0.0;
    }
    let log_prefix = a * x.ln() - x - ln_gamma(a);

    if x < a + 1.0 {
        let mut term = 1.0 / a;
        let mut sum = term;
        let mut n = a;
        for _ in 0..MAX_ITER {
            n += 1.0;
            term *= x / n;
            sum += term;
            if term.abs() < sum.abs() * EPS {
                break;
            }
        }
        return (sum * log_prefix.exp()).clamp(0.0, 1.0);
    }

    // Lentz's method for the upper tail
    let tiny = 1e-300;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / tiny;
    let mut d = 1.0 / b;
    let mut h = d;
    let mut i = 0.0;
    for _ in 0..MAX_ITER {
        i += 1.0;
        let an = -i * (i - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < tiny {
            d = tiny;
        }
        c = b + an / c;
        if c.abs() < tiny {
            c = tiny;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    (1.0 - log_prefix.exp() * h).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tolerance: f64) -> bool {
        (a - b).abs() < tolerance
    }

    #[test]
    fn should_bound_uniform_cdf_to_support() {
        let uniform = Uniform::new(0.0, 3.0);
        assert!(close(uniform.cdf(0.0), 0.0, 1e-12));
        assert!(close(uniform.cdf(1.5), 0.5, 1e-12));
        assert!(close(uniform.cdf(3.0), 1.0, 1e-12));
        assert!(close(uniform.quantile(0.99), 2.97, 1e-12));
    }

    #[test]
    fn should_match_standard_normal_reference_values() {
        let normal = Normal { mean: 0.0, std_dev: 1.0 };
        assert!(close(normal.cdf(0.0), 0.5, 1e-6));
        assert!(close(normal.cdf(1.96), 0.975, 1e-4));
        assert!(close(normal.pdf(0.0), 0.398_942, 1e-5));
        assert!(close(normal.quantile(0.975), 1.96, 1e-2));
    }

    #[test]
    fn should_reduce_gamma_with_unit_shape_to_exponential() {
        let gamma = Gamma { shape: 1.0, scale: 2.0 };
        for x in [0.5, 1.0, 4.0, 10.0] {
            assert!(close(gamma.cdf(x), 1.0 - (-x / 2.0).exp(), 1e-6));
            assert!(close(gamma.pdf(x), 0.5 * (-x / 2.0).exp(), 1e-6));
        }
    }

    #[test]
    fn should_compute_ln_gamma_of_integers() {
        assert!(close(ln_gamma(1.0), 0.0, 1e-10));
        assert!(close(ln_gamma(5.0), 24f64.ln(), 1e-10));
    }

    #[test]
    fn should_invert_genlogistic_cdf() {
        let dist = GenLogistic {
            shape: 2.0,
            loc: 1.0,
            scale: 0.5,
        };
        for p in [0.1, 0.5, 0.9] {
            assert!(close(dist.cdf(dist.quantile(p)), p, 1e-9));
        }
        assert!(close(dist.pdf(1.3), dist.ln_pdf(1.3).exp(), 1e-12));
    }
}
