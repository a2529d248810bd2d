// apps/fvn_cli/src/commands/mod.rs

//! 子命令实现

pub mod info;
pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};
use fvn_config::NonlinearConfig;

/// 读取配置文件，未指定时使用默认配置
pub fn load_config(path: Option<&Path>) -> Result<NonlinearConfig> {
    match path {
        Some(path) => NonlinearConfig::from_file(path)
            .with_context(|| format!("读取配置文件 {} 失败", path.display())),
        None => Ok(NonlinearConfig::default()),
    }
}
