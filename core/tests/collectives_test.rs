mod common;

use adcomm::prelude::*;
use common::{input, run_ranks};
use rand::Rng;

#[test]
fn test_allreduce_sum_random_inputs() {
    let world_size = 4;
    let elements = 3;
    let results = run_ranks(world_size, move |comm, tape| {
        let mut rng = rand::rng();
        let x: Vec<AReal> = (0..elements)
            .map(|_| input(tape, rng.random_range(-10.0..10.0)))
            .collect();
        let mut y = vec![AReal::default(); elements];
        comm.allreduce(tape, Contribution::Buffer(&x), &mut y, OperatorKind::Sum)
            .unwrap();

        // Only rank 0 seeds its copy of the result.
        if comm.rank() == 0 {
            for v in &y {
                tape.set_gradient(v.index, 1.0);
            }
        }
        tape.evaluate().unwrap();

        let primals: Vec<f64> = x.iter().map(|v| v.value).collect();
        let reduced: Vec<f64> = y.iter().map(|v| v.value).collect();
        let grads: Vec<f64> = x.iter().map(|v| tape.gradient(v.index)).collect();
        (primals, reduced, grads)
    });

    // Ascending rank order, exactly as the transport folds.
    let mut expected = results[0].0.clone();
    for (primals, _, _) in &results[1..] {
        for (e, p) in expected.iter_mut().zip(primals) {
            *e += p;
        }
    }
    for (_, reduced, grads) in &results {
        assert_eq!(reduced, &expected);
        assert_eq!(grads, &vec![1.0; elements]);
    }
}

#[test]
fn test_reduce_sum_to_root() {
    let results = run_ranks(3, |comm, tape| {
        let x = input(tape, comm.rank() as f64 + 1.0);
        let mut y = if comm.rank() == 0 {
            vec![AReal::default()]
        } else {
            Vec::new()
        };
        comm.reduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Sum, 0)
            .unwrap();
        if comm.rank() == 0 {
            assert_eq!(y[0].value, 6.0);
            tape.set_gradient(y[0].index, 1.0);
        }
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    assert_eq!(results, vec![1.0, 1.0, 1.0]);
}

#[test]
fn test_reduce_prod_two_ranks() {
    let results = run_ranks(2, |comm, tape| {
        let x = input(tape, if comm.rank() == 0 { 3.0 } else { 4.0 });
        let mut y = [AReal::default()];
        comm.reduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Prod, 0)
            .unwrap();
        if comm.rank() == 0 {
            assert_eq!(y[0].value, 12.0);
            tape.set_gradient(y[0].index, 1.0);
        }
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    assert_eq!(results, vec![4.0, 3.0]);
}

#[test]
fn test_reduce_prod_with_zero_contribution() {
    let results = run_ranks(3, |comm, tape| {
        let x = input(tape, [2.0, 0.0, 5.0][comm.rank()]);
        let mut y = [AReal::default()];
        comm.allreduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Prod)
            .unwrap();
        assert_eq!(y[0].value, 0.0);
        if comm.rank() == 0 {
            tape.set_gradient(y[0].index, 1.0);
        }
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    assert_eq!(results, vec![0.0, 10.0, 0.0]);
}

#[test]
fn test_reduce_max_routes_to_winner() {
    let results = run_ranks(3, |comm, tape| {
        let x = input(tape, [2.0, 5.0, 1.0][comm.rank()]);
        let mut y = [AReal::default()];
        comm.reduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Max, 0)
            .unwrap();
        if comm.rank() == 0 {
            assert_eq!(y[0].value, 5.0);
            tape.set_gradient(y[0].index, 1.0);
        }
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    assert_eq!(results, vec![0.0, 1.0, 0.0]);
}

#[test]
fn test_allreduce_min_tie_goes_to_lowest_rank() {
    let results = run_ranks(3, |comm, tape| {
        let x = input(tape, [2.0, 1.0, 1.0][comm.rank()]);
        let mut y = [AReal::default()];
        comm.allreduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Min)
            .unwrap();
        assert_eq!(y[0].value, 1.0);
        if comm.rank() == 0 {
            tape.set_gradient(y[0].index, 1.0);
        }
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    assert_eq!(results, vec![0.0, 1.0, 0.0]);
}

#[test]
fn test_bcast_sums_adjoints_on_root() {
    let results = run_ranks(3, |comm, tape| {
        let root = 1;
        let x = input(tape, 7.0);
        let mut buf = if comm.rank() == root {
            [x]
        } else {
            [AReal::default()]
        };
        comm.bcast(tape, &mut buf, root).unwrap();
        assert_eq!(buf[0].value, 7.0);

        let z = tape.scale(buf[0], comm.rank() as f64 + 1.0);
        tape.set_gradient(z.index, 1.0);
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    // 1 + 2 + 3 from the three scaled copies
    assert_eq!(results[1], 6.0);
}

#[test]
fn test_gather_to_root() {
    let results = run_ranks(3, |comm, tape| {
        let x = input(tape, comm.rank() as f64 + 1.0);
        let mut all = if comm.rank() == 0 {
            vec![AReal::default(); 3]
        } else {
            Vec::new()
        };
        comm.gather(tape, &[x], &mut all, 0).unwrap();
        if comm.rank() == 0 {
            let values: Vec<f64> = all.iter().map(|v| v.value).collect();
            assert_eq!(values, vec![1.0, 2.0, 3.0]);
            for (i, v) in all.iter().enumerate() {
                tape.set_gradient(v.index, 10.0 * (i + 1) as f64);
            }
        }
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    assert_eq!(results, vec![10.0, 20.0, 30.0]);
}

#[test]
fn test_allgather_combines_every_copy() {
    let results = run_ranks(3, |comm, tape| {
        let x = [input(tape, comm.rank() as f64), input(tape, -(comm.rank() as f64))];
        let mut all = vec![AReal::default(); 6];
        comm.allgather(tape, &x, &mut all).unwrap();
        assert_eq!(all[4].value, 2.0);
        assert_eq!(all[5].value, -2.0);

        for v in &all {
            tape.set_gradient(v.index, comm.rank() as f64 + 1.0);
        }
        tape.evaluate().unwrap();
        (tape.gradient(x[0].index), tape.gradient(x[1].index))
    });
    // every rank's copy is seeded with rank + 1: 1 + 2 + 3
    assert_eq!(results, vec![(6.0, 6.0); 3]);
}

#[test]
fn test_scatter_from_root() {
    let results = run_ranks(3, |comm, tape| {
        let root = 0;
        let send: Vec<AReal> = if comm.rank() == root {
            (0..6).map(|i| input(tape, i as f64)).collect()
        } else {
            Vec::new()
        };
        let mut mine = [AReal::default(); 2];
        comm.scatter(tape, &send, &mut mine, root).unwrap();
        assert_eq!(mine[0].value, 2.0 * comm.rank() as f64);
        assert_eq!(mine[1].value, 2.0 * comm.rank() as f64 + 1.0);

        for (k, v) in mine.iter().enumerate() {
            tape.set_gradient(v.index, (2 * comm.rank() + k) as f64 + 1.0);
        }
        tape.evaluate().unwrap();
        send.iter().map(|v| tape.gradient(v.index)).collect::<Vec<_>>()
    });
    assert_eq!(results[0], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_in_place_reduce_and_allreduce() {
    let results = run_ranks(3, |comm, tape| {
        let x = input(tape, comm.rank() as f64 + 1.0);

        // in-place on the root only
        let mut buf = [x];
        let send = [x];
        let contribution = if comm.rank() == 0 {
            Contribution::InPlace
        } else {
            Contribution::Buffer(&send)
        };
        comm.reduce(tape, contribution, &mut buf, OperatorKind::Sum, 0)
            .unwrap();
        if comm.rank() == 0 {
            assert_eq!(buf[0].value, 6.0);
            assert_ne!(buf[0].index, x.index);
            tape.set_gradient(buf[0].index, 1.0);
        }

        let w = input(tape, 2.0);
        let mut shared = [w];
        comm.allreduce(tape, Contribution::InPlace, &mut shared, OperatorKind::Sum)
            .unwrap();
        assert_eq!(shared[0].value, 6.0);
        if comm.rank() == 2 {
            tape.set_gradient(shared[0].index, 5.0);
        }

        tape.evaluate().unwrap();
        (tape.gradient(x.index), tape.gradient(w.index))
    });
    assert_eq!(results, vec![(1.0, 5.0); 3]);
}

#[test]
fn test_in_place_reduce_off_root_is_rejected() {
    let results = run_ranks(2, |comm, tape| {
        let mut buf = [input(tape, 1.0)];
        // Every rank fails locally before touching the transport.
        matches!(
            comm.ireduce(Contribution::InPlace, &mut buf, OperatorKind::Sum, 5),
            Err(AdError::Protocol(_))
        )
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_reduce_loc_variants() {
    let results = run_ranks(3, |comm, tape| {
        let rank = comm.rank();
        let x = input(tape, [2.0, 5.0, 5.0][rank]);
        let mut best = [LocReal::default()];
        comm.reduce_loc(
            tape,
            &[LocReal::new(x, 10 * rank as i32)],
            &mut best,
            OperatorKind::MaxLoc,
            0,
        )
        .unwrap();
        if rank == 0 {
            assert_eq!(best[0].value.value, 5.0);
            assert_eq!(best[0].loc, 10);
            tape.set_gradient(best[0].value.index, 1.0);
        }

        let w = input(tape, [3.0, 1.0, 1.0][rank]);
        let mut lowest = [LocReal::default()];
        comm.allreduce_loc(
            tape,
            &[LocReal::new(w, [7, 9, 4][rank])],
            &mut lowest,
            OperatorKind::MinLoc,
        )
        .unwrap();
        assert_eq!(lowest[0].value.value, 1.0);
        assert_eq!(lowest[0].loc, 4);
        if rank == 0 {
            tape.set_gradient(lowest[0].value.index, 1.0);
        }

        tape.evaluate().unwrap();
        (tape.gradient(x.index), tape.gradient(w.index))
    });
    assert_eq!(results, vec![(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]);
}

#[test]
fn test_operator_category_mismatch() {
    let results = run_ranks(2, |comm, tape| {
        let x = input(tape, 1.0);
        let mut y = [AReal::default()];
        let located_on_plain = matches!(
            comm.iallreduce(Contribution::Buffer(&[x]), &mut y, OperatorKind::MaxLoc),
            Err(AdError::Protocol(_))
        );
        let mut z = [LocReal::default()];
        let plain_on_located = matches!(
            comm.iallreduce_loc(&[LocReal::new(x, 0)], &mut z, OperatorKind::Sum),
            Err(AdError::Protocol(_))
        );
        located_on_plain && plain_on_located
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_iallreduce_prod_records_on_wait() {
    let results = run_ranks(3, |comm, tape| {
        let x = input(tape, [2.0, 3.0, 4.0][comm.rank()]);
        let mut y = [AReal::default()];
        let request = comm
            .iallreduce(Contribution::Buffer(&[x]), &mut y, OperatorKind::Prod)
            .unwrap();
        assert_eq!(tape.external_function_count(), 0);
        comm.wait(tape, request).unwrap();
        assert_eq!(tape.external_function_count(), 1);
        assert_eq!(y[0].value, 24.0);

        if comm.rank() == 0 {
            tape.set_gradient(y[0].index, 1.0);
        }
        tape.evaluate().unwrap();
        tape.gradient(x.index)
    });
    assert_eq!(results, vec![12.0, 8.0, 6.0]);
}

#[test]
fn test_test_all_completes_together() {
    let results = run_ranks(2, |comm, tape| {
        let x = input(tape, comm.rank() as f64 + 1.0);
        let mut sum = [AReal::default()];
        let mut both = [AReal::default(); 2];
        let completed = {
            let mut requests = vec![
                comm.iallreduce(Contribution::Buffer(&[x]), &mut sum, OperatorKind::Sum)
                    .unwrap(),
                comm.iallgather(&[x], &mut both).unwrap(),
            ];
            while !comm.test_all(tape, &mut requests).unwrap() {
                std::thread::yield_now();
            }
            requests.iter().all(|r| r.is_completed())
        };
        assert!(completed);
        assert_eq!(sum[0].value, 3.0);
        assert_eq!((both[0].value, both[1].value), (1.0, 2.0));
        tape.external_function_count()
    });
    assert_eq!(results, vec![2, 2]);
}

#[test]
fn test_wait_all_in_order() {
    let results = run_ranks(2, |comm, tape| {
        let x = input(tape, 2.0);
        let mut a = [AReal::default()];
        let mut b = [AReal::default()];
        let requests = vec![
            comm.iallreduce(Contribution::Buffer(&[x]), &mut a, OperatorKind::Sum)
                .unwrap(),
            comm.iallreduce(Contribution::Buffer(&[x]), &mut b, OperatorKind::Max)
                .unwrap(),
        ];
        comm.wait_all(tape, requests).unwrap();
        (a[0].value, b[0].value, tape.external_function_count())
    });
    assert_eq!(results, vec![(4.0, 2.0, 2); 2]);
}

#[test]
fn test_passive_collective_records_nothing() {
    let results = run_ranks(3, |comm, tape| {
        let x = AReal::new(comm.rank() as f64);
        let mut y = [AReal::default()];
        comm.allreduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Sum)
            .unwrap();
        let mut z = if comm.rank() == 0 {
            vec![AReal::default()]
        } else {
            Vec::new()
        };
        comm.reduce(tape, Contribution::Buffer(&[x]), &mut z, OperatorKind::Max, 0)
            .unwrap();
        (y[0].value, y[0].is_active(), tape.external_function_count())
    });
    assert_eq!(results, vec![(3.0, false, 0); 3]);
}

#[test]
fn test_single_active_contributor_arms_every_rank() {
    let results = run_ranks(3, |comm, tape| {
        let x = if comm.rank() == 2 {
            input(tape, 4.0)
        } else {
            AReal::new(1.0)
        };
        let mut y = if comm.rank() == 0 {
            vec![AReal::default()]
        } else {
            Vec::new()
        };
        comm.reduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Sum, 0)
            .unwrap();
        if comm.rank() == 0 {
            assert!(y[0].is_active());
            tape.set_gradient(y[0].index, 3.0);
        }
        let handles = tape.external_function_count();
        tape.evaluate().unwrap();
        (handles, tape.gradient(x.index))
    });
    assert_eq!(results, vec![(1, 0.0), (1, 0.0), (1, 3.0)]);
}

#[test]
fn test_forward_tangents_through_allreduce_prod() {
    let results = run_ranks(3, |comm, tape| {
        let x = input(tape, [2.0, 3.0, 4.0][comm.rank()]);
        let mut y = [AReal::default()];
        comm.allreduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Prod)
            .unwrap();
        tape.set_gradient(x.index, 1.0);
        tape.evaluate_forward().unwrap();
        tape.gradient(y[0].index)
    });
    // 3*4 + 2*4 + 2*3
    assert_eq!(results, vec![26.0; 3]);
}

#[test]
fn test_forward_tangents_through_reduce_max() {
    let results = run_ranks(2, |comm, tape| {
        let x = input(tape, [1.0, 8.0][comm.rank()]);
        let mut y = [AReal::default()];
        comm.reduce(tape, Contribution::Buffer(&[x]), &mut y, OperatorKind::Max, 0)
            .unwrap();
        tape.set_gradient(x.index, 10.0 * (comm.rank() + 1) as f64);
        tape.evaluate_forward().unwrap();
        tape.gradient(y[0].index)
    });
    assert_eq!(results[0], 20.0);
}
