//! Plain arithmetic over `f64`. These never fail: out-of-domain inputs yield
//! `NaN` or an infinity, and the tool layer decides what that means.

pub fn add_numbers(a: f64, b: f64) -> f64 {
    a + b
}

pub fn multiply_numbers(a: f64, b: f64) -> f64 {
    a * b
}

pub fn square_root(a: f64) -> f64 {
    a.sqrt()
}

pub fn exponential(a: f64) -> f64 {
    a.exp()
}

/// Natural logarithm.
pub fn ln(a: f64) -> f64 {
    a.ln()
}
