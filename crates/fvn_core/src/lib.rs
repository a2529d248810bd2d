// crates/fvn_core/src/lib.rs

//! FvNewton 核心
//!
//! 有限体积离散的非线性求解核心，包括：
//! - 中间量缓存 (cache) - 按 (历史层, 自由度) 缓存本构中间量
//! - 并行组装 (assembly) - 残差/雅可比组装、缓存更新、跨分区归约
//! - 牛顿迭代 (newton) - 控制器、物理合理度策略、主循环
//! - 模型 (model) - 解的时间历史、回退与辅助方程
//! - 时间推进 (timestep) - 基于牛顿步数的自适应步长
//! - 检查点 (checkpoint) - 控制器状态与缓存的二进制保存
//! - 参考算例 (reference) - 一维非线性扩散
//!
//! # 控制流
//!
//! ```text
//! TimeStepDriver::step
//!   └─ NewtonMethod::apply
//!        ├─ NewtonController::begin
//!        ├─ AssemblyEngine::compute_residual_and_jacobian
//!        ├─ LinearSolver::solve
//!        ├─ FvModel::apply_update
//!        └─ NewtonController::should_continue
//!   ├─ 收敛: FvModel::advance_time_level (缓存历史后移)
//!   └─ 失败: FvModel::update_failed (解与缓存回退), 缩小步长重试
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assembly;
pub mod cache;
pub mod checkpoint;
pub mod comm;
pub mod linear_algebra;
pub mod mesh;
pub mod model;
pub mod newton;
pub mod reference;
pub mod timestep;

// 重导出常用类型
pub use assembly::{
    AssemblyEngine, AssemblyEngineBuilder, AssemblyMetrics, AuxiliaryModule, ElementEvaluator, ElementInput,
    LocalContribution,
};
pub use cache::{CacheSnapshot, IntensiveQuantityCache};
pub use checkpoint::Checkpoint;
pub use comm::{Communicator, DofLayout, SerialCommunicator, ThreadGroupCommunicator};
pub use linear_algebra::{BiCgStabSolver, BlockSparseMatrix, BlockVector, LinearSolveReport, LinearSolver, SolverStatus};
pub use mesh::{MeshTopology, SimpleMesh};
pub use model::FvModel;
pub use newton::{
    ConvergencePolicy, DefectPolicy, NewtonController, NewtonControllerState, NewtonMethod, NewtonOutcome,
    NewtonPhase, Physicality, PhysicalityPolicy, StepFailure,
};
pub use timestep::{StepRecord, TimeStepDriver, TimeStepStats};

/// Prelude 模块，包含常用类型
pub mod prelude {
    pub use crate::assembly::{AssemblyEngine, ElementEvaluator, ElementInput, LocalContribution};
    pub use crate::linear_algebra::{BlockSparseMatrix, BlockVector};
    pub use crate::mesh::{MeshTopology, SimpleMesh};
    pub use crate::model::FvModel;
    pub use crate::newton::{NewtonController, NewtonMethod, NewtonOutcome};
    pub use crate::timestep::TimeStepDriver;
    pub use fvn_foundation::{FvnError, FvnResult};
}
