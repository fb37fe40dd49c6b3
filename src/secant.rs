//! Pure secant-pair kernels for quasi-Newton inverse maintenance.
//!
//! These operate on a dense inverse-Hessian estimate `H` and a secant pair
//! `(s, y)`; the Kronecker-factored maintainer in [`crate::kbfgs`] applies
//! them to each factor's cached inverse.

use ndarray::{Array1, Array2};

use crate::error::CurvatureError;

fn check_pair(
    h: &Array2<f64>,
    s: &Array1<f64>,
    y: &Array1<f64>,
) -> Result<usize, CurvatureError> {
    let n = h.nrows();
    if h.ncols() != n {
        return Err(CurvatureError::shape("secant update: H square", n, h.ncols()));
    }
    if s.len() != n {
        return Err(CurvatureError::shape("secant update: s length", n, s.len()));
    }
    if y.len() != n {
        return Err(CurvatureError::shape("secant update: y length", n, y.len()));
    }
    Ok(n)
}

/// Sherman-Morrison rank-2 update of an inverse-Hessian estimate `H` with the
/// secant pair `(s, y)`:
///
/// `H += (s'y + y'Hy) * ss' / (s'y)^2 - (Hys' + s(Hy)') / s'y`
///
/// After the update `H * y == s` holds for this pair. `s'y != 0` is a caller
/// precondition and is deliberately not checked; callers guarantee it by
/// Powell-damping the pair first ([`powell_lm_damping`]) or by constructing
/// `y` from a positive-definite action on `s`.
pub fn bfgs_inverse_update(
    h: &mut Array2<f64>,
    s: &Array1<f64>,
    y: &Array1<f64>,
) -> Result<(), CurvatureError> {
    let n = check_pair(h, s, y)?;
    let sty = s.dot(y);
    let hy = h.dot(y);
    let ythy = y.dot(&hy);
    let coeff = (sty + ythy) / (sty * sty);
    for i in 0..n {
        for j in 0..n {
            h[[i, j]] += coeff * s[i] * s[j] - (hy[i] * s[j] + s[i] * hy[j]) / sty;
        }
    }
    Ok(())
}

/// Corrects a secant pair in place so that a positive-curvature condition
/// holds before a BFGS update.
///
/// Powell's damping replaces `s <- theta*s + (1-theta)*Hy` with `theta`
/// chosen so that `s'y >= mu1 * y'Hy > 0` afterwards (exactly `mu1 * y'Hy`
/// when the correction engages); the subsequent
/// `y <- y + mu2*s` is Levenberg-Marquardt damping on the inverse. Requires
/// `0 < mu1 < 1` and `mu2 > 0`.
pub fn powell_lm_damping(
    h: &Array2<f64>,
    s: &mut Array1<f64>,
    y: &mut Array1<f64>,
    mu1: f64,
    mu2: f64,
) -> Result<(), CurvatureError> {
    debug_assert!(0.0 < mu1 && mu1 < 1.0, "mu1 must lie in (0, 1)");
    debug_assert!(mu2 > 0.0, "mu2 must be positive");
    check_pair(h, s, y)?;
    let hy = h.dot(y);
    let ythy = y.dot(&hy);
    let sty = s.dot(y);
    let theta = if sty < mu1 * ythy {
        (1.0 - mu1) * ythy / (ythy - sty)
    } else {
        1.0
    };
    if theta != 1.0 {
        log::debug!("powell damping engaged: s'y = {sty:.3e} < mu1 * y'Hy = {:.3e}", mu1 * ythy);
    }
    // Powell's damping on H.
    s.zip_mut_with(&hy, |si, &hyi| *si = theta * *si + (1.0 - theta) * hyi);
    // Levenberg-Marquardt damping on H^{-1}.
    y.zip_mut_with(s, |yi, &si| *yi += mu2 * si);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::prelude::*;
    use rand::rngs::StdRng;

    fn random_spd(n: usize, rng: &mut StdRng) -> Array2<f64> {
        let mut g = Array2::<f64>::zeros((n, n));
        for v in g.iter_mut() {
            *v = rng.random_range(-1.0..1.0);
        }
        let mut spd = g.t().dot(&g);
        for i in 0..n {
            spd[[i, i]] += n as f64;
        }
        spd
    }

    #[test]
    fn update_satisfies_secant_equation() {
        let mut h = Array2::<f64>::eye(3);
        let s = array![0.7, -0.2, 0.5];
        let y = array![1.1, 0.4, -0.3];
        bfgs_inverse_update(&mut h, &s, &y).expect("matching shapes");
        let hy = h.dot(&y);
        for i in 0..3 {
            assert_abs_diff_eq!(hy[i], s[i], epsilon = 1e-12);
        }
        // H stays symmetric.
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(h[[i, j]], h[[j, i]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn update_rejects_dimension_mismatch() {
        let mut h = Array2::<f64>::eye(3);
        let s = array![1.0, 2.0];
        let y = array![1.0, 2.0, 3.0];
        assert!(matches!(
            bfgs_inverse_update(&mut h, &s, &y),
            Err(CurvatureError::Shape { .. })
        ));
    }

    #[test]
    fn powell_damping_enforces_curvature_condition() {
        let mu1 = 0.2;
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let h = random_spd(4, &mut rng);
            let mut s = Array1::<f64>::zeros(4);
            let mut y = Array1::<f64>::zeros(4);
            for i in 0..4 {
                s[i] = rng.random_range(-2.0..2.0);
                y[i] = rng.random_range(-2.0..2.0);
            }
            let ythy_before = y.dot(&h.dot(&y));
            powell_lm_damping(&h, &mut s, &mut y, mu1, 1e-3).expect("matching shapes");
            // The guarantee is stated against the curvature of the original y;
            // the LM shift only adds mu2 * s's' on top.
            assert!(
                s.dot(&y) >= mu1 * ythy_before - 1e-10,
                "curvature condition violated: s'y = {}, mu1*y'Hy = {}",
                s.dot(&y),
                mu1 * ythy_before
            );
        }
    }

    #[test]
    fn powell_damping_leaves_good_pairs_nearly_unchanged() {
        let h = Array2::<f64>::eye(2);
        let mut s = array![1.0, 0.0];
        let mut y = array![2.0, 0.0];
        // s'y = 2 >= mu1 * y'Hy = 0.8, so theta = 1 and only the LM shift runs.
        powell_lm_damping(&h, &mut s, &mut y, 0.2, 0.5).expect("matching shapes");
        assert_abs_diff_eq!(s[0], 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(y[0], 2.5, epsilon = 1e-15);
    }
}
