// crates/fvn_core/src/newton/mod.rs

//! 牛顿迭代
//!
//! - [`policy`]: 收敛/物理合理度策略
//! - [`controller`]: 迭代控制与步长建议
//! - [`method`]: 组装-求解-更新主循环

pub mod controller;
pub mod method;
pub mod policy;

pub use controller::{NewtonController, NewtonControllerState, NewtonPhase};
pub use method::{NewtonMethod, NewtonOutcome, StepFailure};
pub use policy::{ConvergencePolicy, DefectPolicy, Physicality, PhysicalityPolicy};
