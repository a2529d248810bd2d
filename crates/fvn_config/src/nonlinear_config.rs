// crates/fvn_config/src/nonlinear_config.rs

//! NonlinearConfig - 非线性求解配置
//!
//! 汇总牛顿控制器、组装引擎、中间量缓存、线性求解器和时间推进的参数。
//! 所有字段都带 serde 默认值，空 JSON 对象即得到默认配置。

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// 非线性求解总配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NonlinearConfig {
    /// 牛顿控制器
    #[serde(default)]
    pub newton: NewtonConfig,

    /// 组装引擎
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// 中间量缓存
    #[serde(default)]
    pub cache: CacheConfig,

    /// 线性求解器
    #[serde(default)]
    pub linear: LinearSolverConfig,

    /// 时间推进
    #[serde(default)]
    pub time: TimeSteppingConfig,

    /// 参考算例
    #[serde(default)]
    pub problem: ProblemConfig,
}

// ============================================================
// 牛顿控制器
// ============================================================

/// 收敛判据使用的缺陷度量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefectMeasure {
    /// 牛顿更新量的 2-范数
    #[default]
    Update,
    /// 残差的 2-范数
    Residual,
}

/// 牛顿控制器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewtonConfig {
    /// 相对收敛容差
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// 目标迭代步数（步长建议以此为基准）
    #[serde(default = "default_target_steps")]
    pub target_steps: usize,

    /// 最大迭代步数
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// 缺陷度量
    #[serde(default)]
    pub defect: DefectMeasure,

    /// 每步输出迭代信息
    #[serde(default)]
    pub verbose: bool,
}

fn default_tolerance() -> f64 { 1e-5 }
fn default_target_steps() -> usize { 8 }
fn default_max_steps() -> usize { 12 }

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            target_steps: default_target_steps(),
            max_steps: default_max_steps(),
            defect: DefectMeasure::default(),
            verbose: false,
        }
    }
}

// ============================================================
// 组装引擎
// ============================================================

/// 组装策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStrategyKind {
    /// 串行
    Sequential,
    /// 并行（工作线程池）
    Parallel,
    /// 按单元数自动选择
    #[default]
    Auto,
}

/// 组装引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// 工作线程数，0 表示使用可用核数
    #[serde(default)]
    pub threads: usize,

    /// 组装策略
    #[serde(default)]
    pub strategy: AssemblyStrategyKind,

    /// Auto 策略下启用并行的最小单元数
    #[serde(default = "default_min_parallel_elements")]
    pub min_parallel_elements: usize,
}

fn default_min_parallel_elements() -> usize { 1000 }

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            strategy: AssemblyStrategyKind::default(),
            min_parallel_elements: default_min_parallel_elements(),
        }
    }
}

// ============================================================
// 中间量缓存
// ============================================================

/// 中间量缓存配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 启用缓存（get 可命中）
    #[serde(default = "default_true")]
    pub enable_cache: bool,

    /// 启用热启动提示
    #[serde(default = "default_true")]
    pub enable_hints: bool,

    /// 历史层数
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_true() -> bool { true }
fn default_history_size() -> usize { 2 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            enable_hints: true,
            history_size: default_history_size(),
        }
    }
}

impl CacheConfig {
    /// 是否需要存储中间量（缓存或提示任一启用）
    pub fn stores_quantities(&self) -> bool {
        self.enable_cache || self.enable_hints
    }
}

// ============================================================
// 线性求解器
// ============================================================

/// 预条件器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionerKind {
    /// 无预条件
    None,
    /// Jacobi
    Jacobi,
    /// ILU(0)
    #[default]
    Ilu0,
}

/// 线性求解器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSolverConfig {
    /// 最大 Krylov 迭代次数
    #[serde(default = "default_linear_max_iter")]
    pub max_iter: usize,

    /// 绝对容差
    #[serde(default = "default_linear_atol")]
    pub atol: f64,

    /// 预条件器
    #[serde(default)]
    pub preconditioner: PreconditionerKind,
}

fn default_linear_max_iter() -> usize { 500 }
fn default_linear_atol() -> f64 { 1e-30 }

impl Default for LinearSolverConfig {
    fn default() -> Self {
        Self {
            max_iter: default_linear_max_iter(),
            atol: default_linear_atol(),
            preconditioner: PreconditionerKind::default(),
        }
    }
}

// ============================================================
// 时间推进
// ============================================================

/// 时间推进配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSteppingConfig {
    /// 初始时间步长
    #[serde(default = "default_initial_dt")]
    pub initial_dt: f64,

    /// 最小时间步长
    #[serde(default = "default_dt_min")]
    pub dt_min: f64,

    /// 最大时间步长
    #[serde(default = "default_dt_max")]
    pub dt_max: f64,

    /// 结束时间
    #[serde(default = "default_end_time")]
    pub end_time: f64,

    /// 单个时间步允许的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_initial_dt() -> f64 { 1e-3 }
fn default_dt_min() -> f64 { 1e-9 }
fn default_dt_max() -> f64 { 1.0 }
fn default_end_time() -> f64 { 0.1 }
fn default_max_retries() -> usize { 10 }

impl Default for TimeSteppingConfig {
    fn default() -> Self {
        Self {
            initial_dt: default_initial_dt(),
            dt_min: default_dt_min(),
            dt_max: default_dt_max(),
            end_time: default_end_time(),
            max_retries: default_max_retries(),
        }
    }
}

// ============================================================
// 参考算例
// ============================================================

/// 一维非线性扩散参考算例配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemConfig {
    /// 单元数
    #[serde(default = "default_n_cells")]
    pub n_cells: usize,

    /// 区域长度
    #[serde(default = "default_length")]
    pub length: f64,

    /// 初始脉冲峰值
    #[serde(default = "default_peak")]
    pub peak: f64,

    /// 进程内模拟的分区数（线程组通信）
    #[serde(default = "default_ranks")]
    pub ranks: usize,
}

fn default_n_cells() -> usize { 100 }
fn default_length() -> f64 { 1.0 }
fn default_peak() -> f64 { 1.0 }
fn default_ranks() -> usize { 1 }

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            n_cells: default_n_cells(),
            length: default_length(),
            peak: default_peak(),
            ranks: default_ranks(),
        }
    }
}

// ============================================================
// 加载与验证
// ============================================================

impl NonlinearConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// 从 JSON 字符串加载配置
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: NonlinearConfig =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 验证配置有效性，返回第一个不合法的键
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.newton.validate()?;
        self.cache.validate()?;
        self.linear.validate()?;
        self.time.validate()?;
        self.problem.validate()?;
        Ok(())
    }
}

impl NewtonConfig {
    /// 验证牛顿参数
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance > 0.0) {
            return Err(ConfigError::invalid("newton.tolerance", self.tolerance, "容差必须为正"));
        }
        if self.target_steps == 0 {
            return Err(ConfigError::invalid("newton.target_steps", 0, "目标步数必须为正"));
        }
        // 物理性单调约束使用 step/(max_steps-1)，需要留出余量
        if self.max_steps <= self.target_steps + 3 {
            return Err(ConfigError::invalid(
                "newton.max_steps",
                self.max_steps,
                format!("必须大于 target_steps + 3 = {}", self.target_steps + 3),
            ));
        }
        Ok(())
    }
}

impl CacheConfig {
    /// 验证缓存参数
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size < 2 {
            return Err(ConfigError::invalid(
                "cache.history_size",
                self.history_size,
                "至少需要当前层和上一层",
            ));
        }
        Ok(())
    }
}

impl LinearSolverConfig {
    /// 验证线性求解器参数
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iter == 0 {
            return Err(ConfigError::invalid("linear.max_iter", 0, "迭代次数必须为正"));
        }
        if self.atol < 0.0 {
            return Err(ConfigError::invalid("linear.atol", self.atol, "不能为负"));
        }
        Ok(())
    }
}

impl TimeSteppingConfig {
    /// 验证时间推进参数
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt_min > 0.0) {
            return Err(ConfigError::invalid("time.dt_min", self.dt_min, "必须为正"));
        }
        if self.dt_max < self.dt_min {
            return Err(ConfigError::invalid("time.dt_max", self.dt_max, "不能小于 dt_min"));
        }
        if self.initial_dt < self.dt_min || self.initial_dt > self.dt_max {
            return Err(ConfigError::invalid(
                "time.initial_dt",
                self.initial_dt,
                "必须在 [dt_min, dt_max] 内",
            ));
        }
        if !(self.end_time > 0.0) {
            return Err(ConfigError::invalid("time.end_time", self.end_time, "必须为正"));
        }
        Ok(())
    }
}

impl ProblemConfig {
    /// 验证算例参数
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_cells < 2 {
            return Err(ConfigError::invalid("problem.n_cells", self.n_cells, "至少两个单元"));
        }
        if !(self.length > 0.0) {
            return Err(ConfigError::invalid("problem.length", self.length, "必须为正"));
        }
        if self.peak < 0.0 {
            return Err(ConfigError::invalid("problem.peak", self.peak, "不能为负"));
        }
        if self.ranks == 0 || self.ranks > self.n_cells {
            return Err(ConfigError::invalid(
                "problem.ranks",
                self.ranks,
                "必须在 [1, n_cells] 内",
            ));
        }
        Ok(())
    }
}
