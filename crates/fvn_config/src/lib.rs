// crates/fvn_config/src/lib.rs

//! FvNewton Config Layer
//!
//! 配置层，提供牛顿迭代、并行组装、中间量缓存、线性求解和时间推进的配置。
//! 全部配置通过结构体显式传入，不存在进程级静态开关。
//!
//! # 模块概览
//!
//! - [`nonlinear_config`]: `NonlinearConfig` 及各子配置
//! - [`error`]: 配置错误类型
//!
//! # 层级架构
//!
//! ```text
//! fvn_cli        ─> 读取 JSON 配置, 构建求解器
//! fvn_core       ─> 使用 NewtonConfig / AssemblyConfig / CacheConfig
//! fvn_config     ─> 本层
//! fvn_foundation ─> 错误类型
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod nonlinear_config;

// 重导出核心类型
pub use error::ConfigError;
pub use nonlinear_config::{
    AssemblyConfig, AssemblyStrategyKind, CacheConfig, DefectMeasure, LinearSolverConfig,
    NewtonConfig, NonlinearConfig, PreconditionerKind, ProblemConfig, TimeSteppingConfig,
};
