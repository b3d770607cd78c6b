#![allow(dead_code)]

use adcomm::prelude::*;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

/// Spawns one thread per rank, each with its own transport, and returns the
/// closures' results in rank order.
pub fn run_transports<R, F>(world_size: usize, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(ChannelTransport) -> R + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = ChannelTransport::world(world_size)
        .into_iter()
        .map(|transport| {
            let f = f.clone();
            thread::spawn(move || f(transport))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Like [`run_transports`], with a ready registry, communicator and a
/// recording tape of the given vector width on every rank.
pub fn run_ranks_with<R, F>(world_size: usize, config: AdConfig, width: usize, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(&AdComm<'_, ChannelTransport>, &mut Tape) -> R + Send + Sync + 'static,
{
    run_transports(world_size, move |transport| {
        let transport = Rc::new(transport);
        let registry = OperatorRegistry::init(&*transport).unwrap();
        let comm = AdComm::new(transport.clone(), &registry, config);
        let mut tape = Tape::with_vector_width(width);
        tape.set_active();
        f(&comm, &mut tape)
    })
}

pub fn run_ranks<R, F>(world_size: usize, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(&AdComm<'_, ChannelTransport>, &mut Tape) -> R + Send + Sync + 'static,
{
    run_ranks_with(world_size, AdConfig::default(), 1, f)
}

/// A fresh tape input.
pub fn input(tape: &mut Tape, value: f64) -> AReal {
    let mut x = AReal::new(value);
    tape.register_input(&mut x);
    x
}
