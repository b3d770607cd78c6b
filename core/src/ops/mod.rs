//! Reduction operators.
//!
//! An [`OperatorDescriptor`] pairs the primal combination used while
//! reducing with the adjoint kernels that route the result's adjoint back to
//! the contributions:
//!
//! | Operator | Needs primals | Reverse routing |
//! |---|---|---|
//! | sum | no | adjoint copied to every contribution |
//! | product | yes | adjoint times the product of the *other* contributions |
//! | min / max | yes | adjoint to the lowest rank holding the result, zero elsewhere |
//! | min-loc / max-loc | yes | as min / max, matching value and location |
//!
//! The pre-adjoint kernel runs once on the rank that owns the result's
//! adjoint (the root, or every rank for all-reduce); the post-adjoint kernel
//! runs on each contributing rank. Both must be linear in the adjoint: the
//! tangent sweep derives each rank's partial derivative by applying them to
//! a vector of ones.

use crate::error::Result;
use adcomm_kernels::{self as kernels, Located};
use std::fmt;

pub mod registry;

pub use registry::{CustomOperator, OperatorRegistry};

/// Identifies an operator in the [`OperatorRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Sum,
    Prod,
    Min,
    Max,
    MinLoc,
    MaxLoc,
    /// Registered with [`OperatorRegistry::register`]; ids count up from `0`
    /// in registration order.
    Custom(u32),
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Prod => write!(f, "prod"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::MinLoc => write!(f, "min-loc"),
            Self::MaxLoc => write!(f, "max-loc"),
            Self::Custom(id) => write!(f, "custom-{id}"),
        }
    }
}

/// Primal combination of two contributions, accumulator first.
#[derive(Clone, Copy)]
pub enum PrimalKernel {
    Value(fn(f64, f64) -> f64),
    Located(fn(Located<f64>, Located<f64>) -> Located<f64>),
}

impl PrimalKernel {
    pub fn is_located(&self) -> bool {
        matches!(self, Self::Located(_))
    }
}

impl fmt::Debug for PrimalKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Value(..)"),
            Self::Located(_) => f.write_str("Located(..)"),
        }
    }
}

/// What an adjoint kernel may look at.
///
/// `primals` holds every rank's contribution (`ranks` blocks of `elements`),
/// `result` the reduced primal. Both are empty for operators that do not
/// need primals. The location slices are only filled for located reductions.
#[derive(Debug, Clone, Copy)]
pub struct AdjointContext<'a> {
    pub rank: usize,
    pub ranks: usize,
    pub elements: usize,
    pub width: usize,
    pub primals: &'a [f64],
    pub result: &'a [f64],
    pub locations: &'a [i32],
    pub result_locations: &'a [i32],
}

/// Transforms `elements * width` adjoint reals in place.
pub type AdjointKernel = fn(&mut [f64], &AdjointContext<'_>) -> Result<()>;

#[derive(Clone, Copy)]
pub struct OperatorDescriptor {
    pub kind: OperatorKind,
    pub commutative: bool,
    pub needs_primal: bool,
    pub primal: PrimalKernel,
    pub pre_adjoint: Option<AdjointKernel>,
    pub post_adjoint: Option<AdjointKernel>,
}

impl fmt::Debug for OperatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorDescriptor")
            .field("kind", &self.kind)
            .field("commutative", &self.commutative)
            .field("needs_primal", &self.needs_primal)
            .field("primal", &self.primal)
            .field("pre_adjoint", &self.pre_adjoint.is_some())
            .field("post_adjoint", &self.post_adjoint.is_some())
            .finish()
    }
}

impl OperatorDescriptor {
    pub fn is_located(&self) -> bool {
        self.primal.is_located()
    }

    /// Runs the pre-adjoint kernel, if any.
    pub fn apply_pre(&self, adjoints: &mut [f64], ctx: &AdjointContext<'_>) -> Result<()> {
        match self.pre_adjoint {
            Some(kernel) => kernel(adjoints, ctx),
            None => Ok(()),
        }
    }

    /// Runs the post-adjoint kernel, if any.
    pub fn apply_post(&self, adjoints: &mut [f64], ctx: &AdjointContext<'_>) -> Result<()> {
        match self.post_adjoint {
            Some(kernel) => kernel(adjoints, ctx),
            None => Ok(()),
        }
    }

    /// Local partial derivative of the result with respect to each rank's
    /// contribution, `ranks` blocks of `elements`.
    ///
    /// `owner` is the rank the pre-adjoint kernel runs on.
    pub fn partials(&self, ctx: &AdjointContext<'_>, owner: usize) -> Result<Vec<f64>> {
        let unit = AdjointContext { width: 1, ..*ctx };
        let mut seeded = vec![1.0; ctx.elements];
        self.apply_pre(&mut seeded, &AdjointContext { rank: owner, ..unit })?;

        let mut out = Vec::with_capacity(ctx.ranks * ctx.elements);
        for rank in 0..ctx.ranks {
            let mut partial = seeded.clone();
            self.apply_post(&mut partial, &AdjointContext { rank, ..unit })?;
            out.extend_from_slice(&partial);
        }
        Ok(out)
    }

    pub fn sum() -> Self {
        Self {
            kind: OperatorKind::Sum,
            commutative: true,
            needs_primal: false,
            primal: PrimalKernel::Value(kernels::sum),
            pre_adjoint: None,
            post_adjoint: None,
        }
    }

    pub fn prod() -> Self {
        Self {
            kind: OperatorKind::Prod,
            commutative: true,
            needs_primal: true,
            primal: PrimalKernel::Value(kernels::prod),
            pre_adjoint: None,
            post_adjoint: Some(prod_post_adjoint),
        }
    }

    pub fn min() -> Self {
        Self {
            kind: OperatorKind::Min,
            commutative: true,
            needs_primal: true,
            primal: PrimalKernel::Value(kernels::min),
            pre_adjoint: None,
            post_adjoint: Some(extremum_post_adjoint),
        }
    }

    pub fn max() -> Self {
        Self {
            kind: OperatorKind::Max,
            primal: PrimalKernel::Value(kernels::max),
            ..Self::min()
        }
    }

    pub fn min_loc() -> Self {
        Self {
            kind: OperatorKind::MinLoc,
            commutative: true,
            needs_primal: true,
            primal: PrimalKernel::Located(kernels::min_loc),
            pre_adjoint: None,
            post_adjoint: Some(located_post_adjoint),
        }
    }

    pub fn max_loc() -> Self {
        Self {
            kind: OperatorKind::MaxLoc,
            primal: PrimalKernel::Located(kernels::max_loc),
            ..Self::min_loc()
        }
    }

    /// The built-in operators, in registration order.
    pub fn builtins() -> [Self; 6] {
        [
            Self::sum(),
            Self::prod(),
            Self::min(),
            Self::max(),
            Self::min_loc(),
            Self::max_loc(),
        ]
    }
}

/// d(x_0 * .. * x_{n-1}) / dx_r is the product of every other contribution.
fn prod_post_adjoint(adjoints: &mut [f64], ctx: &AdjointContext<'_>) -> Result<()> {
    let factors = kernels::exclusive_product(ctx.primals, ctx.elements, ctx.ranks, ctx.rank)?;
    kernels::scale_blocks(adjoints, &factors, ctx.width)?;
    Ok(())
}

fn extremum_post_adjoint(adjoints: &mut [f64], ctx: &AdjointContext<'_>) -> Result<()> {
    let winners = kernels::value_winners(ctx.primals, ctx.result, ctx.elements, ctx.ranks)?;
    kernels::mask_non_winners(adjoints, &winners, ctx.rank, ctx.width)?;
    Ok(())
}

fn located_post_adjoint(adjoints: &mut [f64], ctx: &AdjointContext<'_>) -> Result<()> {
    let located = |values: &[f64], locs: &[i32]| -> Vec<Located<f64>> {
        values.iter().zip(locs).map(|(&v, &l)| Located::new(v, l)).collect()
    };
    let primals = located(ctx.primals, ctx.locations);
    let result = located(ctx.result, ctx.result_locations);
    let winners = kernels::located_winners(&primals, &result, ctx.elements, ctx.ranks)?;
    kernels::mask_non_winners(adjoints, &winners, ctx.rank, ctx.width)?;
    Ok(())
}
