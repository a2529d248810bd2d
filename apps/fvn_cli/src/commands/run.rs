// apps/fvn_cli/src/commands/run.rs

//! 运行参考算例
//!
//! `--ranks N` 大于 1 时在进程内用 N 个线程模拟区域分解，
//! 每个线程持有一个分区，通过线程组通信完成归约。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::{info, warn};

use fvn_config::NonlinearConfig;
use fvn_core::checkpoint::Checkpoint;
use fvn_core::comm::{Communicator, SerialCommunicator, ThreadGroupCommunicator};
use fvn_core::reference::{DiffusionQuantities, DiffusionSetup, ProbeModule};
use fvn_core::TimeStepStats;

use super::load_config;

/// 运行参数
#[derive(Args)]
pub struct RunArgs {
    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 单元数（覆盖配置）
    #[arg(long)]
    pub cells: Option<usize>,

    /// 结束时间（覆盖配置）
    #[arg(short = 't', long)]
    pub end_time: Option<f64>,

    /// 初始时间步长（覆盖配置）
    #[arg(long)]
    pub dt: Option<f64>,

    /// 分区数（覆盖配置）
    #[arg(long)]
    pub ranks: Option<usize>,

    /// 每个分区的组装线程数（覆盖配置）
    #[arg(long)]
    pub threads: Option<usize>,

    /// 在区域中心添加探针辅助方程
    #[arg(long)]
    pub probe: bool,

    /// 结束时写出检查点
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// 从检查点续算
    #[arg(long)]
    pub resume: Option<PathBuf>,
}

/// 执行运行命令
pub fn execute(args: RunArgs) -> Result<()> {
    info!("=== FvNewton 参考算例 ===");

    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate().context("配置无效")?;

    let ranks = config.problem.ranks;
    info!(
        "非线性扩散: {} 单元, 分区 {}, 结束时间 {} , 初始步长 {}",
        config.problem.n_cells, ranks, config.time.end_time, config.time.initial_dt
    );

    let start = Instant::now();
    let stats = if ranks > 1 {
        if args.checkpoint.is_some() || args.resume.is_some() {
            bail!("多分区运行不支持检查点");
        }
        run_partitioned(&config, &args)?
    } else {
        run_rank(&config, &args, Arc::new(SerialCommunicator))?
    };

    info!(
        "完成: {} 步, 拒绝 {} 次, 平均牛顿步数 {:.2}, 步长范围 [{:.3e}, {:.3e}], 用时 {:.2?}",
        stats.accepted_steps,
        stats.rejected_attempts,
        stats.avg_newton_iterations(),
        stats.min_dt.unwrap_or(0.0),
        stats.max_dt.unwrap_or(0.0),
        start.elapsed()
    );
    Ok(())
}

fn apply_overrides(config: &mut NonlinearConfig, args: &RunArgs) {
    if let Some(cells) = args.cells {
        config.problem.n_cells = cells;
    }
    if let Some(end_time) = args.end_time {
        config.time.end_time = end_time;
    }
    if let Some(dt) = args.dt {
        config.time.initial_dt = dt;
    }
    if let Some(ranks) = args.ranks {
        config.problem.ranks = ranks;
    }
    if let Some(threads) = args.threads {
        config.assembly.threads = threads;
    }
}

fn run_partitioned(config: &NonlinearConfig, args: &RunArgs) -> Result<TimeStepStats> {
    let comms = ThreadGroupCommunicator::group(config.problem.ranks);
    let results: Vec<Result<TimeStepStats>> = std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || run_rank(config, args, Arc::new(comm))))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow::anyhow!("分区线程异常退出"))))
            .collect()
    });

    let mut first = None;
    for (rank, result) in results.into_iter().enumerate() {
        let stats = result.with_context(|| format!("分区 {rank} 失败"))?;
        first.get_or_insert(stats);
    }
    first.context("没有分区")
}

fn run_rank(config: &NonlinearConfig, args: &RunArgs, comm: Arc<dyn Communicator>) -> Result<TimeStepStats> {
    let rank = comm.rank();
    let mut setup = DiffusionSetup::with_communicator(config, comm).context("构建参考算例失败")?;

    if args.probe {
        let target = setup.model.engine().n_grid_dofs() / 2;
        setup
            .model
            .add_auxiliary_module(Box::new(ProbeModule::new(target)))
            .context("添加探针失败")?;
    }

    if let Some(path) = &args.resume {
        Checkpoint::<DiffusionQuantities>::load(path)
            .with_context(|| format!("读取检查点 {} 失败", path.display()))?
            .restore_into(&mut setup.model, &mut setup.driver, &mut setup.newton)
            .context("检查点与当前配置不一致")?;
        info!("从 t={:.6e} 续算", setup.driver.time());
    }

    let initial_mass = setup.model.global_storage(0)?[0];
    let DiffusionSetup { model, newton, driver } = &mut setup;
    let stats = driver.run(model, newton, |record, model| {
        if rank == 0 {
            let mass = model.global_storage(0)?[0];
            info!(
                "步 {}: t={:.6e}, dt={:.3e}, 牛顿步数 {}, 重试 {}, 质量误差 {:.3e}",
                record.index,
                record.time,
                record.dt,
                record.newton_steps,
                record.retries,
                (mass - initial_mass) / initial_mass.abs().max(f64::MIN_POSITIVE)
            );
        }
        Ok(())
    })?;

    if rank == 0 {
        let metrics = setup.model.engine().metrics();
        info!(
            "组装: {} 次 (雅可比 {}, 并行 {}), 平均每单元 {:?}",
            metrics.total_calls,
            metrics.jacobian_calls,
            metrics.parallel_calls,
            metrics.avg_time_per_element()
        );
        if stats.rejected_attempts > 0 {
            warn!("共有 {} 次时间步被拒绝", stats.rejected_attempts);
        }
    }

    if let Some(path) = &args.checkpoint {
        Checkpoint::capture(&setup.model, &setup.driver, &setup.newton)
            .save(path)
            .with_context(|| format!("写出检查点 {} 失败", path.display()))?;
        info!("检查点: {}", path.display());
    }
    Ok(stats)
}
