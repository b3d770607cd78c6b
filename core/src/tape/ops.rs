//! Recording helpers for the reference tape.
//!
//! Each helper computes the primal and records the local partials. The result
//! is passive when the tape is not recording or every argument is passive.

use super::{AReal, Tape};

impl Tape {
    pub fn add(&mut self, lhs: AReal, rhs: AReal) -> AReal {
        self.push_statement(lhs.value + rhs.value, &[(lhs, 1.0), (rhs, 1.0)])
    }

    pub fn sub(&mut self, lhs: AReal, rhs: AReal) -> AReal {
        self.push_statement(lhs.value - rhs.value, &[(lhs, 1.0), (rhs, -1.0)])
    }

    pub fn mul(&mut self, lhs: AReal, rhs: AReal) -> AReal {
        // d(xy)/dx = y, d(xy)/dy = x
        self.push_statement(lhs.value * rhs.value, &[(lhs, rhs.value), (rhs, lhs.value)])
    }

    /// `factor * x` with a passive factor.
    pub fn scale(&mut self, x: AReal, factor: f64) -> AReal {
        self.push_statement(x.value * factor, &[(x, factor)])
    }

    /// Sum of all `values`, recorded as one statement.
    pub fn sum(&mut self, values: &[AReal]) -> AReal {
        let total = values.iter().map(|v| v.value).sum();
        let args: Vec<(AReal, f64)> = values.iter().map(|v| (*v, 1.0)).collect();
        self.push_statement(total, &args)
    }
}
