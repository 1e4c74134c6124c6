//! Integration tests for the forward executor.
//!
//! The same pipelines are evaluated serially, over thread teams and over
//! rank groups; every configuration must produce identical results.

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use taskfuse::ops::{Map, Reduce, SinCos, Square, VectorSource};
use taskfuse::{
    ChainView, EngineError, ExecutionContext, Graph, Kernel, LocalComm, NodeId, NodeOp, Runner,
    TaskScratch, ValueSpec,
};

fn gaussian_data(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    (0..n).map(|_| normal.sample(&mut rng)).collect()
}

fn vector(g: &mut Graph, label: &str, data: &[f64]) -> NodeId {
    let id = g
        .add_node(
            label,
            NodeOp::Stream(Box::new(VectorSource::new(data.len()))),
            &[],
        )
        .unwrap();
    g.set_data(id.value(), data).unwrap();
    id
}

/// x -> x^2 -> sum, the whole thing in one fused chain.
fn sum_of_squares(data: &[f64]) -> (Graph, NodeId) {
    let mut g = Graph::new();
    let x = vector(&mut g, "x", data);
    let sq = g
        .add_node("sq", NodeOp::Stream(Box::new(Map::new(Square))), &[x.value()])
        .unwrap();
    let sum = g
        .add_node("sum", NodeOp::Stream(Box::new(Reduce::Sum)), &[sq.value()])
        .unwrap();
    assert_eq!(g.chains().len(), 1);
    (g, sum)
}

#[test]
fn test_sum_of_squares_serial() {
    let data = gaussian_data(1000, 7);
    let expected: f64 = data.iter().map(|x| x * x).sum();

    let (mut g, sum) = sum_of_squares(&data);
    let mut runner = Runner::new(&g).unwrap();
    runner.run(&mut g, &ExecutionContext::serial()).unwrap();

    assert_relative_eq!(g.value(sum.value()).get(0), expected, epsilon = 1e-9);
}

#[test]
fn test_thread_teams_match_serial() {
    let data = gaussian_data(1000, 11);
    let (mut g, sum) = sum_of_squares(&data);
    let mut runner = Runner::new(&g).unwrap();

    runner.run(&mut g, &ExecutionContext::serial()).unwrap();
    let reference = g.value(sum.value()).get(0);

    for threads in [1, 2, 4, 8] {
        runner
            .run(&mut g, &ExecutionContext::threaded(threads))
            .unwrap();
        assert_relative_eq!(g.value(sum.value()).get(0), reference, epsilon = 1e-9);
    }
}

#[test]
fn test_rank_groups_match_serial() {
    let data = gaussian_data(500, 13);
    let (mut g, sum) = sum_of_squares(&data);
    let mut runner = Runner::new(&g).unwrap();
    runner.run(&mut g, &ExecutionContext::serial()).unwrap();
    let reference = g.value(sum.value()).get(0);

    for size in [1, 2, 4] {
        let comms = LocalComm::group(size);
        let mut results = vec![0.0; size];
        std::thread::scope(|scope| {
            for (comm, out) in comms.iter().zip(results.iter_mut()) {
                let data = &data;
                scope.spawn(move || {
                    // every rank assembles the same graph and takes its
                    // strided share of the tasks
                    let (mut g, sum) = sum_of_squares(data);
                    let mut runner = Runner::new(&g).unwrap();
                    runner.run(&mut g, &ExecutionContext::new(comm, 1)).unwrap();
                    *out = g.value(sum.value()).get(0);
                });
            }
        });
        for r in results {
            assert_relative_eq!(r, reference, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_mean_divides_by_task_count() {
    let data = gaussian_data(64, 3);
    let expected: f64 = data.iter().sum::<f64>() / 64.0;

    let mut g = Graph::new();
    let x = vector(&mut g, "x", &data);
    let mean = g
        .add_node("mean", NodeOp::Stream(Box::new(Reduce::Mean)), &[x.value()])
        .unwrap();
    let mut runner = Runner::new(&g).unwrap();
    runner.run(&mut g, &ExecutionContext::serial()).unwrap();

    assert_relative_eq!(g.value(mean.value()).get(0), expected, epsilon = 1e-12);
}

#[test]
fn test_multi_component_outputs() {
    let data = [0.3, -1.2, 2.8];
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &data);
    let sc = g
        .add_node("sc", NodeOp::Stream(Box::new(Map::new(SinCos))), &[x.value()])
        .unwrap();
    g.mark_stored(sc.component(0));
    g.mark_stored(sc.component(1));

    let mut runner = Runner::new(&g).unwrap();
    runner.run(&mut g, &ExecutionContext::serial()).unwrap();

    assert_eq!(g.value(sc.component(0)).name(), "sc.sin");
    assert_eq!(g.value(sc.component(1)).name(), "sc.cos");
    for (i, &v) in data.iter().enumerate() {
        assert_relative_eq!(g.value(sc.component(0)).get(i), v.sin(), epsilon = 1e-12);
        assert_relative_eq!(g.value(sc.component(1)).get(i), v.cos(), epsilon = 1e-12);
    }
}

#[test]
fn test_stored_split_matches_fused() {
    let data = gaussian_data(120, 19);
    let (mut fused, fsum) = sum_of_squares(&data);
    let mut runner = Runner::new(&fused).unwrap();
    runner.run(&mut fused, &ExecutionContext::serial()).unwrap();

    // same pipeline with the intermediate materialized: two chains, same
    // numbers
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &data);
    let sq = g
        .add_node("sq", NodeOp::Stream(Box::new(Map::new(Square))), &[x.value()])
        .unwrap();
    g.mark_stored(sq.value());
    let sum = g
        .add_node("sum", NodeOp::Stream(Box::new(Reduce::Sum)), &[sq.value()])
        .unwrap();
    assert_eq!(g.chains().len(), 2);

    let mut split_runner = Runner::new(&g).unwrap();
    split_runner.run(&mut g, &ExecutionContext::serial()).unwrap();

    assert_relative_eq!(
        g.value(sum.value()).get(0),
        fused.value(fsum.value()).get(0),
        epsilon = 1e-9
    );
    for (i, &v) in data.iter().enumerate() {
        assert_relative_eq!(g.value(sq.value()).get(i), v * v, epsilon = 1e-12);
    }
}

#[test]
fn test_buffer_sizes_follow_the_layout() {
    let data = gaussian_data(50, 23);
    let (g, _) = sum_of_squares(&data);
    let runner = Runner::new(&g).unwrap();

    assert_eq!(runner.n_chains(), 1);
    assert_eq!(runner.task_count(0), 50);
    // one slot per argument (2) and per component (3)
    assert_eq!(runner.n_quantities(0), 5);
    // the only derivative block is the leaf's 50 elements
    assert_eq!(runner.n_derivatives(0), 50);
    // only the scalar accumulates: value plus its derivative row
    assert_eq!(runner.buffer_size(0), 1 + 50);
}

#[test]
fn test_runner_rejects_changed_graph() {
    let data = [1.0, 2.0];
    let (mut g, _) = sum_of_squares(&data);
    let mut runner = Runner::new(&g).unwrap();
    vector(&mut g, "y", &[3.0, 4.0]);

    let err = runner.run(&mut g, &ExecutionContext::serial()).unwrap_err();
    assert!(matches!(err, EngineError::StaleLayout));
}

#[test]
fn test_source_only_graph_runs_clean() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &[1.0, 2.0, 3.0]);
    let mut runner = Runner::new(&g).unwrap();
    runner.run(&mut g, &ExecutionContext::serial()).unwrap();
    assert_eq!(g.value(x.value()).data(), &[1.0, 2.0, 3.0]);
}

/// A pointwise sampled grid: task `t` fills point `t` with `x^3` and a
/// single derivative lane with the slope.
struct CubeGrid;

impl Kernel for CubeGrid {
    fn build(&self, ctx: &taskfuse::BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        let n = ctx.vector_length()?;
        Ok(vec![ValueSpec::grid(&[n])])
    }

    fn perform_task(&self, view: &ChainView, scratch: &mut TaskScratch) {
        let x = view.arg(0, scratch);
        view.add_value(0, x * x * x, scratch);
        view.add_grid_derivative(0, 0, 3.0 * x * x, scratch);
    }
}

#[test]
fn test_grid_values_interleave_point_derivatives() {
    let data = [0.5, 1.0, 2.0, -1.5];
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &data);
    let cube = g
        .add_node("cube", NodeOp::Stream(Box::new(CubeGrid)), &[x.value()])
        .unwrap();
    assert_eq!(g.chains().len(), 1);

    let mut runner = Runner::new(&g).unwrap();
    runner.run(&mut g, &ExecutionContext::serial()).unwrap();

    let v = g.value(cube.value());
    for (i, &x) in data.iter().enumerate() {
        assert_relative_eq!(v.get(i), x * x * x, epsilon = 1e-12);
        assert_relative_eq!(v.grid_derivative(i, 0), 3.0 * x * x, epsilon = 1e-12);
    }
}

#[test]
fn test_grid_derivatives_stay_per_point_across_steps() {
    let first = [0.5, 1.0, 2.0, -1.5];
    let second = [1.5, -0.5, 0.25, 3.0];
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &first);
    let cube = g
        .add_node("cube", NodeOp::Stream(Box::new(CubeGrid)), &[x.value()])
        .unwrap();

    let ctx = ExecutionContext::serial();
    let mut runner = Runner::new(&g).unwrap();
    runner.run(&mut g, &ctx).unwrap();

    // each point carries only its own slope, not a running sum over the
    // tasks the scratch already streamed
    let v = g.value(cube.value());
    for (i, &x) in first.iter().enumerate() {
        assert_relative_eq!(v.grid_derivative(i, 0), 3.0 * x * x, epsilon = 1e-12);
    }

    // next step pushes new data through the same frozen layout and scratch
    g.set_data(x.value(), &second).unwrap();
    runner.run(&mut g, &ctx).unwrap();

    let v = g.value(cube.value());
    for (i, &x) in second.iter().enumerate() {
        assert_relative_eq!(v.get(i), x * x * x, epsilon = 1e-12);
        assert_relative_eq!(v.grid_derivative(i, 0), 3.0 * x * x, epsilon = 1e-12);
    }
}
