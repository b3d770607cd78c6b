mod common;

use adcomm::TransportError;
use adcomm::ops::{AdjointContext, PrimalKernel};
use adcomm::prelude::*;
use common::{input, run_transports};
use std::rc::Rc;

/// Contributions after the first count twice.
fn double_off_first(adjoints: &mut [f64], ctx: &AdjointContext<'_>) -> adcomm::Result<()> {
    if ctx.rank != 0 {
        adjoints.iter_mut().for_each(|a| *a *= 2.0);
    }
    Ok(())
}

/// d(x_0 + x_1^2 + ..) / dx_r for r > 0 reads the contribution itself.
fn square_off_first(adjoints: &mut [f64], ctx: &AdjointContext<'_>) -> adcomm::Result<()> {
    if ctx.rank == 0 {
        return Ok(());
    }
    let own = &ctx.primals[ctx.rank * ctx.elements..(ctx.rank + 1) * ctx.elements];
    for (block, x) in adjoints.chunks_mut(ctx.width).zip(own) {
        block.iter_mut().for_each(|a| *a *= 2.0 * x);
    }
    Ok(())
}

fn plain_sum() -> CustomOperator {
    CustomOperator {
        commutative: true,
        needs_primal: false,
        primal: PrimalKernel::Value(|a, b| a + b),
        pre_adjoint: None,
        post_adjoint: None,
    }
}

fn weighted() -> CustomOperator {
    CustomOperator {
        commutative: false,
        needs_primal: false,
        primal: PrimalKernel::Value(|acc, b| acc + 2.0 * b),
        pre_adjoint: None,
        post_adjoint: Some(double_off_first),
    }
}

fn sum_of_squares() -> CustomOperator {
    CustomOperator {
        commutative: false,
        needs_primal: true,
        primal: PrimalKernel::Value(|acc, b| acc + b * b),
        pre_adjoint: None,
        post_adjoint: Some(square_off_first),
    }
}

/// Runs `f` on every rank with a registry holding the three custom operators.
fn with_custom_ops<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(&AdComm<'_, ChannelTransport>, &mut Tape, [OperatorKind; 3]) -> R + Send + Sync + 'static,
{
    run_transports(n, move |t| {
        let transport = Rc::new(t);
        let mut registry = OperatorRegistry::init(&*transport).unwrap();
        let kinds = [
            registry.register(&*transport, plain_sum()),
            registry.register(&*transport, weighted()),
            registry.register(&*transport, sum_of_squares()),
        ];
        let out = {
            let comm = AdComm::new(transport.clone(), &registry, AdConfig::default());
            let mut tape = Tape::new();
            tape.set_active();
            f(&comm, &mut tape, kinds)
        };
        registry.finalize(&*transport).unwrap();
        out
    })
}

#[test]
fn test_custom_ids_match_across_ranks() {
    let results = with_custom_ops(2, |_, _, kinds| kinds);
    let expected = [
        OperatorKind::Custom(0),
        OperatorKind::Custom(1),
        OperatorKind::Custom(2),
    ];
    assert_eq!(results, vec![expected; 2]);
}

#[test]
fn test_custom_sum_behaves_like_builtin() {
    let results = with_custom_ops(3, |comm, tape, [sum, _, _]| {
        let x = input(tape, comm.rank() as f64 + 1.0);
        let mut y = [AReal::default()];
        comm.allreduce(tape, Contribution::Buffer(&[x]), &mut y, sum).unwrap();
        if comm.rank() == 1 {
            tape.set_gradient(y[0].index, 2.0);
        }
        tape.evaluate().unwrap();
        (y[0].value, tape.gradient(x.index))
    });
    assert_eq!(results, vec![(6.0, 2.0); 3]);
}

#[test]
fn test_custom_post_adjoint_scales_per_rank() {
    let results = with_custom_ops(3, |comm, tape, [_, weighted, _]| {
        let x = input(tape, comm.rank() as f64 + 1.0);
        let mut y = [AReal::default()];
        comm.allreduce(tape, Contribution::Buffer(&[x]), &mut y, weighted)
            .unwrap();
        if comm.rank() == 0 {
            tape.set_gradient(y[0].index, 1.0);
        }
        tape.evaluate().unwrap();
        (y[0].value, tape.gradient(x.index))
    });
    // 1 + 2*2 + 2*3
    assert_eq!(results, vec![(11.0, 1.0), (11.0, 2.0), (11.0, 2.0)]);
}

#[test]
fn test_custom_reduce_to_root_routes_through_post_adjoint() {
    let results = with_custom_ops(3, |comm, tape, [_, weighted, _]| {
        let x = input(tape, 1.0);
        let mut y = [AReal::default()];
        comm.reduce(tape, Contribution::Buffer(&[x]), &mut y, weighted, 2)
            .unwrap();
        if comm.rank() == 2 {
            assert_eq!(y[0].value, 5.0);
            tape.set_gradient(y[0].index, 3.0);
        }
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    assert_eq!(results, vec![3.0, 6.0, 6.0]);
}

#[test]
fn test_custom_operator_reads_primals() {
    let results = with_custom_ops(3, |comm, tape, [_, _, squares]| {
        let x = input(tape, comm.rank() as f64 + 1.0);
        let mut y = [AReal::default()];
        comm.allreduce(tape, Contribution::Buffer(&[x]), &mut y, squares)
            .unwrap();
        if comm.rank() == 0 {
            tape.set_gradient(y[0].index, 1.0);
        }
        tape.evaluate().unwrap();
        (y[0].value, tape.gradient(x.index))
    });
    // 1 + 2^2 + 3^2
    assert_eq!(results, vec![(14.0, 1.0), (14.0, 4.0), (14.0, 6.0)]);
}

#[test]
fn test_custom_operator_forward_tangents() {
    let results = with_custom_ops(2, |comm, tape, [_, _, squares]| {
        let x = input(tape, [5.0, 3.0][comm.rank()]);
        let mut y = [AReal::default()];
        comm.allreduce(tape, Contribution::Buffer(&[x]), &mut y, squares)
            .unwrap();
        tape.set_gradient(x.index, 1.0);
        tape.evaluate_forward().unwrap();
        tape.gradient(y[0].index)
    });
    // 1 + 2*3
    assert_eq!(results, vec![7.0, 7.0]);
}

#[test]
fn test_unregistered_operator_is_rejected() {
    let results = with_custom_ops(2, |comm, tape, _| {
        let x = input(tape, 1.0);
        let mut y = [AReal::default()];
        matches!(
            comm.iallreduce(Contribution::Buffer(&[x]), &mut y, OperatorKind::Custom(9)),
            Err(AdError::UnknownOperator(_))
        )
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_finalize_releases_wire_operators() {
    let results = run_transports(2, |t| {
        let registry = OperatorRegistry::init(&t).unwrap();
        let handle = registry.wire_op(OperatorKind::Sum).unwrap();
        registry.finalize(&t).unwrap();
        matches!(t.free_op(handle), Err(TransportError::UnknownOperator(_)))
    });
    assert_eq!(results, vec![true, true]);
}
