// apps/fvn_cli/src/commands/validate.rs

//! 配置验证命令
//!
//! 除了逐项检查参数外，还给出一些可能导致性能或收敛问题的警告。

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::{error, info, warn};

use fvn_config::{AssemblyStrategyKind, NonlinearConfig};

/// 验证参数
#[derive(Args)]
pub struct ValidateArgs {
    /// 配置文件路径
    #[arg(short, long)]
    pub config: PathBuf,

    /// 严格模式（警告也视为错误）
    #[arg(long)]
    pub strict: bool,
}

/// 执行验证命令
pub fn execute(args: ValidateArgs) -> Result<()> {
    info!("=== FvNewton 配置验证 ===");

    let config = NonlinearConfig::from_file(&args.config)
        .with_context(|| format!("配置文件 {} 无效", args.config.display()))?;

    let warnings = collect_warnings(&config);
    for w in &warnings {
        warn!("{w}");
    }

    if args.strict && !warnings.is_empty() {
        error!("严格模式下存在 {} 条警告", warnings.len());
        bail!("验证失败");
    }

    info!("配置有效: {}", args.config.display());
    Ok(())
}

fn collect_warnings(config: &NonlinearConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if !config.cache.enable_cache && !config.cache.enable_hints {
        warnings.push("中间量缓存与热启动提示都已关闭，每次组装都会重新计算本构关系".to_string());
    }
    if config.assembly.strategy == AssemblyStrategyKind::Parallel && config.assembly.threads == 1 {
        warnings.push("并行组装只配置了 1 个线程".to_string());
    }
    if config.problem.ranks > 1 && config.problem.n_cells < 4 * config.problem.ranks {
        warnings.push(format!(
            "{} 个单元划分为 {} 个分区，重叠单元占比过高",
            config.problem.n_cells, config.problem.ranks
        ));
    }
    if config.time.initial_dt > config.time.end_time {
        warnings.push("初始步长大于结束时间".to_string());
    }
    if config.newton.tolerance < 1e-12 {
        warnings.push(format!(
            "牛顿容差 {:.1e} 过小，线性求解器可能无法达到对应精度",
            config.newton.tolerance
        ));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_no_warnings() {
        assert!(collect_warnings(&NonlinearConfig::default()).is_empty());
    }

    #[test]
    fn test_disabled_cache_warns() {
        let mut config = NonlinearConfig::default();
        config.cache.enable_cache = false;
        config.cache.enable_hints = false;
        assert_eq!(collect_warnings(&config).len(), 1);
    }
}
