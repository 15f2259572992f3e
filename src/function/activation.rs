//! Scalar activations and their derivatives.

/// `1 / (1 + exp(-x))`
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// The inverse of [`sigmoid`], with the input clamped into `(0, 1)`.
#[inline]
pub fn logit(y: f32) -> f32 {
    let y = y.clamp(1e-6, 1.0 - 1e-6);
    (y / (1.0 - y)).ln()
}

/// `log(1 + exp(x))`, stable for large `|x|`.
#[inline]
pub fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else if x < -20.0 {
        x.exp()
    } else {
        x.exp().ln_1p()
    }
}

/// The inverse of [`softplus`] for `y > 0`.
#[inline]
pub fn softplus_inverse(y: f32) -> f32 {
    let y = y.max(1e-12);
    if y > 20.0 {
        y
    } else {
        y.exp_m1().ln()
    }
}

/// `d softplus(x) / dx = sigmoid(x)`
#[inline]
pub fn softplus_grad(x: f32) -> f32 {
    sigmoid(x)
}
