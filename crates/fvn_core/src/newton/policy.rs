// crates/fvn_core/src/newton/policy.rs

//! 收敛策略
//!
//! 控制器在判断是否继续迭代时，通过 [`ConvergencePolicy`] 取得当前迭代解的
//! 物理合理度（0 表示完全不可接受，1 表示完全合理）。
//!
//! - [`PhysicalityPolicy`]: 由外部 [`Physicality`] 回调给出合理度
//! - [`DefectPolicy`]: 只看数值收敛，合理度恒为 1

use std::sync::Arc;

use crate::linear_algebra::BlockVector;
use crate::mesh::MeshTopology;

/// 物理合理度回调
pub trait Physicality: Send + Sync {
    /// 迭代解的合理度，期望范围 [0, 1]
    fn physicality(&self, solution: &BlockVector) -> f64;

    /// 绑定当前网格（每次牛顿求解前调用，网格变化后据此更新自由度信息）
    fn bind_mesh(&mut self, _mesh: &Arc<dyn MeshTopology>) {}
}

impl<F> Physicality for F
where
    F: Fn(&BlockVector) -> f64 + Send + Sync,
{
    fn physicality(&self, solution: &BlockVector) -> f64 {
        self(solution)
    }
}

/// 收敛策略
pub trait ConvergencePolicy: Send + Sync {
    /// 策略名称
    fn name(&self) -> &str;

    /// 迭代解的合理度
    fn physicality(&self, solution: &BlockVector) -> f64;

    /// 绑定当前网格
    fn bind_mesh(&mut self, _mesh: &Arc<dyn MeshTopology>) {}
}

/// 带物理合理度约束的策略
pub struct PhysicalityPolicy {
    name: String,
    physicality: Box<dyn Physicality>,
}

impl PhysicalityPolicy {
    /// 由回调创建
    pub fn new(physicality: impl Physicality + 'static) -> Self {
        Self::named("physicality", physicality)
    }

    /// 由回调创建并命名
    pub fn named(name: impl Into<String>, physicality: impl Physicality + 'static) -> Self {
        Self {
            name: name.into(),
            physicality: Box::new(physicality),
        }
    }
}

impl ConvergencePolicy for PhysicalityPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn physicality(&self, solution: &BlockVector) -> f64 {
        self.physicality.physicality(solution)
    }

    fn bind_mesh(&mut self, mesh: &Arc<dyn MeshTopology>) {
        self.physicality.bind_mesh(mesh);
    }
}

impl std::fmt::Debug for PhysicalityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalityPolicy").field("name", &self.name).finish()
    }
}

/// 纯数值收敛策略
#[derive(Debug, Clone, Copy, Default)]
pub struct DefectPolicy;

impl ConvergencePolicy for DefectPolicy {
    fn name(&self) -> &str {
        "defect"
    }

    fn physicality(&self, _solution: &BlockVector) -> f64 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_policy() {
        let policy = PhysicalityPolicy::new(|u: &BlockVector| {
            let n = u.len().max(1) as f64;
            u.as_slice().iter().filter(|&&v| v >= 0.0).count() as f64 / n
        });
        let u = BlockVector::from_flat(1, vec![1.0, -1.0, 2.0, 3.0]);
        assert!((policy.physicality(&u) - 0.75).abs() < 1e-15);
        assert_eq!(policy.name(), "physicality");
    }

    #[test]
    fn test_defect_policy_is_always_physical() {
        let u = BlockVector::from_flat(1, vec![-5.0]);
        assert_eq!(DefectPolicy.physicality(&u), 1.0);
    }
}
