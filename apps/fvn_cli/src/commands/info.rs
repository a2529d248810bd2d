// apps/fvn_cli/src/commands/info.rs

//! 信息显示命令

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use fvn_core::checkpoint::Checkpoint;
use fvn_core::reference::DiffusionQuantities;

use super::load_config;

/// 信息显示参数
#[derive(Args)]
pub struct InfoArgs {
    /// 配置文件路径（显示合并默认值后的完整配置）
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 显示检查点摘要
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// 显示系统信息
    #[arg(long)]
    pub system: bool,
}

/// 执行信息命令
pub fn execute(args: InfoArgs) -> Result<()> {
    info!("=== FvNewton 信息 ===");

    if args.system {
        print_system_info();
    }

    if let Some(path) = &args.checkpoint {
        print_checkpoint(path)?;
    }

    if args.config.is_some() || (!args.system && args.checkpoint.is_none()) {
        let config = load_config(args.config.as_deref())?;
        println!("=== 配置 ===");
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    Ok(())
}

fn print_system_info() {
    println!("=== 系统信息 ===");
    println!("FvNewton CLI 版本: {}", env!("CARGO_PKG_VERSION"));
    println!("目标平台: {}", std::env::consts::ARCH);
    println!("操作系统: {}", std::env::consts::OS);
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    println!("可用核数: {cores}");
}

fn print_checkpoint(path: &Path) -> Result<()> {
    let checkpoint = Checkpoint::<DiffusionQuantities>::load(path)
        .with_context(|| format!("读取检查点 {} 失败", path.display()))?;
    println!("=== 检查点 {} ===", path.display());
    println!("时间: {:.6e}", checkpoint.time);
    println!("下一步长: {:.3e}", checkpoint.dt);
    println!("已完成时间步: {}", checkpoint.step_index);
    println!(
        "牛顿步数: {} (目标 {}, 上限 {})",
        checkpoint.controller.step_count, checkpoint.controller.target_steps, checkpoint.controller.max_steps
    );
    println!("历史层: {}, 自由度: {}", checkpoint.cache.history_size, checkpoint.cache.n_dofs);
    for (slot, entries) in checkpoint.cache.slots.iter().enumerate() {
        let valid = entries.iter().filter(|(_, up_to_date)| *up_to_date).count();
        println!("  层 {slot}: 有效缓存 {valid}/{}", entries.len());
    }
    Ok(())
}
