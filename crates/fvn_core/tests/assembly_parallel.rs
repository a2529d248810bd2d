//! 并行组装与区域分解测试
//!
//! - 多线程组装与单线程组装结果一致
//! - 两个分区（线程组通信）与单分区的残差范数、时间步结果一致
//! - 辅助线性求解器能求解组装出的雅可比

use std::collections::BTreeMap;
use std::sync::Arc;

use fvn_config::{AssemblyStrategyKind, NonlinearConfig};
use fvn_core::comm::{Communicator, ThreadGroupCommunicator};
use fvn_core::linear_algebra::{BiCgStabSolver, LinearSolver};
use fvn_core::reference::DiffusionSetup;

fn config(n_cells: usize) -> NonlinearConfig {
    let mut config = NonlinearConfig::default();
    config.problem.n_cells = n_cells;
    config.problem.peak = 2.0;
    config.time.initial_dt = 0.01;
    config.time.end_time = 0.02;
    config
}

#[test]
fn test_thread_count_does_not_change_linearization() {
    let mut seq_config = config(200);
    seq_config.assembly.strategy = AssemblyStrategyKind::Sequential;
    seq_config.assembly.threads = 1;
    let mut par_config = config(200);
    par_config.assembly.strategy = AssemblyStrategyKind::Parallel;
    par_config.assembly.threads = 4;

    let mut seq = DiffusionSetup::new(&seq_config).unwrap();
    let mut par = DiffusionSetup::new(&par_config).unwrap();
    seq.model.engine_mut().set_time(0.01, 0.01);
    par.model.engine_mut().set_time(0.01, 0.01);

    let (mut r1, mut j1) = (seq.model.engine().create_vector(), seq.model.engine().create_matrix());
    let (mut r2, mut j2) = (par.model.engine().create_vector(), par.model.engine().create_matrix());
    let n1 = seq.model.linearize(&mut r1, &mut j1).unwrap();
    let n2 = par.model.linearize(&mut r2, &mut j2).unwrap();

    assert!((n1 - n2).abs() <= 1e-12 * n1.max(1.0));
    for (a, b) in r1.as_slice().iter().zip(r2.as_slice()) {
        assert!((a - b).abs() < 1e-12);
    }
    for (a, b) in j1.values().iter().zip(j2.values()) {
        assert!((a - b).abs() < 1e-10);
    }
    assert_eq!(par.model.engine().metrics().parallel_calls, 1);
    assert_eq!(par.model.engine().n_threads(), 4);
}

#[test]
fn test_bicgstab_solves_reference_jacobian() {
    let cfg = config(64);
    let mut setup = DiffusionSetup::new(&cfg).unwrap();
    setup.model.engine_mut().set_time(0.01, 0.01);
    let engine = setup.model.engine();
    let (mut r, mut j) = (engine.create_vector(), engine.create_matrix());
    setup.model.linearize(&mut r, &mut j).unwrap();

    let mut solver = BiCgStabSolver::new(cfg.linear.clone());
    let mut x = setup.model.engine().create_vector();
    let report = solver.solve(&j, &mut x, &r, 1e-10).unwrap();
    assert!(report.converged);

    let mut jx = setup.model.engine().create_vector();
    j.mul_vec(&x, &mut jx).unwrap();
    for (a, b) in jx.as_slice().iter().zip(r.as_slice()) {
        assert!((a - b).abs() < 1e-8 * (1.0 + b.abs()));
    }
}

/// 在每个分区上执行 `f`，按分区编号返回结果
fn run_partitioned<T, F>(ranks: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Arc<dyn Communicator>) -> T + Sync,
{
    let comms = ThreadGroupCommunicator::group(ranks);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                let f = &f;
                s.spawn(move || f(Arc::new(c)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_two_ranks_reproduce_serial_residual_norm() {
    let cfg = config(50);
    let mut serial = DiffusionSetup::new(&cfg).unwrap();
    let mut r = serial.model.engine().create_vector();
    let serial_norm = serial.model.global_residual(&mut r).unwrap();
    assert!(serial_norm > 0.0);

    let norms = run_partitioned(2, |comm| {
        let mut setup = DiffusionSetup::with_communicator(&cfg, comm).unwrap();
        let mut r = setup.model.engine().create_vector();
        setup.model.global_residual(&mut r).unwrap()
    });
    for norm in norms {
        assert!((norm - serial_norm).abs() < 1e-12 * serial_norm);
    }
}

#[test]
fn test_two_ranks_reproduce_serial_time_step() {
    let cfg = config(40);
    let mut serial = DiffusionSetup::new(&cfg).unwrap();
    let serial_record = serial.step().unwrap();
    let expected = serial.model.solution(0).as_slice().to_vec();

    let parts = run_partitioned(3, |comm| {
        let mut setup = DiffusionSetup::with_communicator(&cfg, comm).unwrap();
        let record = setup.step().unwrap();
        let layout = Arc::clone(setup.model.engine().layout());
        let owned: Vec<(usize, f64)> = (0..setup.model.engine().n_grid_dofs())
            .filter(|&d| layout.is_owned(d))
            .map(|d| (layout.global_id(d), setup.model.solution(0).block(d)[0]))
            .collect();
        (record, owned)
    });

    let mut merged = BTreeMap::new();
    for (record, owned) in parts {
        assert_eq!(record.newton_steps, serial_record.newton_steps);
        assert!((record.dt - serial_record.dt).abs() < 1e-15);
        for (gid, value) in owned {
            assert!(merged.insert(gid, value).is_none(), "global dof {gid} owned twice");
        }
    }
    assert_eq!(merged.len(), expected.len());
    for (gid, value) in merged {
        assert!((value - expected[gid]).abs() < 1e-8, "dof {gid}: {value} vs {}", expected[gid]);
    }
}
