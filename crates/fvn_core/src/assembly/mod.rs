// crates/fvn_core/src/assembly/mod.rs

//! 残差与雅可比组装
//!
//! - [`evaluator`]: 单元计算器与辅助方程接口
//! - [`engine`]: 线程池并行组装、缓存更新与跨分区归约

pub mod engine;
pub mod evaluator;

pub use engine::{AssemblyEngine, AssemblyEngineBuilder, AssemblyMetrics};
pub use evaluator::{AuxiliaryModule, ElementEvaluator, ElementInput, LocalContribution};
