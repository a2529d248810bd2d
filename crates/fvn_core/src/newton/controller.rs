// crates/fvn_core/src/newton/controller.rs

//! 牛顿迭代控制器
//!
//! 决定是否继续迭代，兼顾数值收敛与迭代解的物理合理度：
//!
//! 1. 前两步总是继续
//! 2. 步数超过上限则终止
//! 3. 已收敛则停止
//! 4. 合理度 ≤ 0，或低于 step/(max_steps-1)，则拒绝
//! 5. 合理度低于历史最大值时进入试用期，第三次回落拒绝
//! 6. 否则更新历史最大值，试用计数减一
//!
//! 同时根据本次迭代步数给出下一时间步长的建议：超过目标步数时
//! 按超出比例缩小，否则按不足比例的 1/1.2 放大。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fvn_config::NewtonConfig;
use fvn_foundation::{FvnError, FvnResult};

use super::policy::{ConvergencePolicy, DefectPolicy};
use crate::linear_algebra::{BlockSparseMatrix, BlockVector, LinearSolveReport, LinearSolver};
use crate::mesh::MeshTopology;

/// 初始解范数的下限
const MIN_MAGNITUDE: f64 = 1e-5;

/// 线性求解相对容差与牛顿容差之比
const LINEAR_TOLERANCE_FACTOR: f64 = 1e-8;

/// 控制器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewtonPhase {
    /// 尚未开始
    Idle,
    /// 迭代中
    Iterating,
    /// 已收敛
    Converged,
    /// 被物理合理度策略拒绝
    Failed,
    /// 超过最大步数
    Aborted,
}

/// 控制器状态快照
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewtonControllerState {
    /// 阶段
    pub phase: NewtonPhase,
    /// 已完成的迭代步数
    pub step_count: usize,
    /// 收敛容差
    pub tolerance: f64,
    /// 目标步数
    pub target_steps: usize,
    /// 最大步数
    pub max_steps: usize,
    /// 当前迭代解的合理度
    pub current_physicality: f64,
    /// 历史最大合理度
    pub max_physicality: f64,
    /// 试用计数
    pub probation_count: usize,
    /// 初始解范数的倒数
    pub one_by_magnitude: f64,
    /// 最近一次的缺陷
    pub defect: f64,
}

/// 牛顿迭代控制器
pub struct NewtonController {
    config: NewtonConfig,
    policy: Box<dyn ConvergencePolicy>,
    phase: NewtonPhase,
    step_count: usize,
    current_physicality: f64,
    max_physicality: f64,
    probation_count: usize,
    one_by_magnitude: f64,
    defect: f64,
}

impl NewtonController {
    /// 创建控制器（纯数值收敛策略）
    ///
    /// 要求 `max_steps > target_steps + 3`，容差为正，目标步数至少为 1。
    pub fn new(config: NewtonConfig) -> FvnResult<Self> {
        if !(config.tolerance > 0.0) || !config.tolerance.is_finite() {
            return Err(FvnError::config(format!(
                "牛顿容差必须为正数: {}",
                config.tolerance
            )));
        }
        if config.target_steps == 0 {
            return Err(FvnError::config("目标迭代步数至少为 1"));
        }
        if config.max_steps <= config.target_steps + 3 {
            return Err(FvnError::config(format!(
                "最大迭代步数 {} 必须大于目标步数 {} + 3",
                config.max_steps, config.target_steps
            )));
        }
        Ok(Self {
            config,
            policy: Box::new(DefectPolicy),
            phase: NewtonPhase::Idle,
            step_count: 0,
            current_physicality: 0.0,
            max_physicality: 0.0,
            probation_count: 0,
            one_by_magnitude: 1.0,
            defect: f64::INFINITY,
        })
    }

    /// 替换收敛策略
    pub fn with_policy(mut self, policy: Box<dyn ConvergencePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// 配置
    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    /// 收敛策略
    pub fn policy(&self) -> &dyn ConvergencePolicy {
        self.policy.as_ref()
    }

    /// 把当前网格交给收敛策略
    pub fn bind_mesh(&mut self, mesh: &Arc<dyn MeshTopology>) {
        self.policy.bind_mesh(mesh);
    }

    /// 当前阶段
    pub fn phase(&self) -> NewtonPhase {
        self.phase
    }

    /// 本次求解已完成的迭代步数
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// 当前合理度
    pub fn current_physicality(&self) -> f64 {
        self.current_physicality
    }

    /// 历史最大合理度
    pub fn max_physicality(&self) -> f64 {
        self.max_physicality
    }

    /// 试用计数
    pub fn probation_count(&self) -> usize {
        self.probation_count
    }

    /// 最近一次的缺陷（未归一化）
    pub fn defect(&self) -> f64 {
        self.defect
    }

    /// 归一化缺陷
    pub fn relative_defect(&self) -> f64 {
        self.defect * self.one_by_magnitude
    }

    /// 状态快照
    pub fn state(&self) -> NewtonControllerState {
        NewtonControllerState {
            phase: self.phase,
            step_count: self.step_count,
            tolerance: self.config.tolerance,
            target_steps: self.config.target_steps,
            max_steps: self.config.max_steps,
            current_physicality: self.current_physicality,
            max_physicality: self.max_physicality,
            probation_count: self.probation_count,
            one_by_magnitude: self.one_by_magnitude,
            defect: self.defect,
        }
    }

    /// 恢复步数（检查点）
    pub fn restore_step_count(&mut self, step_count: usize) {
        self.step_count = step_count;
    }

    // ========== 迭代 ==========

    /// 开始一次非线性求解
    pub fn begin(&mut self, initial_solution_norm: f64) {
        self.phase = NewtonPhase::Iterating;
        self.step_count = 0;
        self.probation_count = 0;
        self.current_physicality = 0.0;
        self.max_physicality = 0.0;
        self.defect = f64::INFINITY;
        self.one_by_magnitude = 1.0 / initial_solution_norm.max(MIN_MAGNITUDE);
    }

    /// 是否再做一次迭代；返回 false 时 [`phase`](Self::phase) 给出停止原因
    pub fn should_continue(&mut self, solution: &BlockVector) -> bool {
        if self.step_count < 2 {
            return true;
        }
        if self.step_count > self.config.max_steps {
            self.phase = NewtonPhase::Aborted;
            return false;
        }
        if self.is_converged() {
            self.phase = NewtonPhase::Converged;
            return false;
        }

        self.current_physicality = self.policy.physicality(solution).min(1.0);
        let p = self.current_physicality;

        if p <= 0.0 {
            log::debug!("迭代解不可接受: physicality={p:.3}");
            self.phase = NewtonPhase::Failed;
            false
        } else if p < self.step_count as f64 / (self.config.max_steps - 1) as f64 {
            // 合理度必须随步数单调提高，最后一步时必须完全合理
            log::debug!(
                "合理度 {p:.3} 低于第 {} 步的要求 {:.3}",
                self.step_count,
                self.step_count as f64 / (self.config.max_steps - 1) as f64
            );
            self.phase = NewtonPhase::Failed;
            false
        } else if p < self.max_physicality {
            if self.probation_count > 1 {
                log::debug!(
                    "合理度再次回落 ({p:.3} < {:.3})，试用期结束",
                    self.max_physicality
                );
                self.phase = NewtonPhase::Failed;
                false
            } else {
                self.probation_count += 1;
                true
            }
        } else {
            self.max_physicality = p;
            self.probation_count = self.probation_count.saturating_sub(1);
            true
        }
    }

    /// 是否收敛：归一化缺陷不超过容差且合理度为 1
    pub fn is_converged(&self) -> bool {
        self.defect * self.one_by_magnitude <= self.config.tolerance && self.current_physicality >= 1.0
    }

    /// 一次迭代结束：步数加一，记录缺陷并重新计算合理度
    pub fn end_iteration(&mut self, solution: &BlockVector, defect: f64) {
        self.step_count += 1;
        self.defect = defect;
        self.current_physicality = self.policy.physicality(solution).min(1.0);
        if self.config.verbose {
            log::info!(
                "牛顿迭代 {} 完成: defect={:.6e}, physicality={:.3}, max_physicality={:.3}",
                self.step_count,
                self.relative_defect(),
                self.current_physicality,
                self.max_physicality
            );
        } else {
            log::debug!(
                "牛顿迭代 {} 完成: defect={:.6e}, physicality={:.3}, max_physicality={:.3}",
                self.step_count,
                self.relative_defect(),
                self.current_physicality,
                self.max_physicality
            );
        }
    }

    /// 求解失败：步数置为目标步数的两倍，使下一次步长建议大幅缩小
    pub fn on_step_failed(&mut self) {
        if self.phase == NewtonPhase::Iterating || self.phase == NewtonPhase::Converged {
            self.phase = NewtonPhase::Failed;
        }
        self.step_count = 2 * self.config.target_steps;
    }

    /// 下一时间步长建议
    pub fn suggest_next_step_size(&self, previous_dt: f64) -> f64 {
        let n = self.step_count as f64;
        let target = self.config.target_steps as f64;
        if self.step_count > self.config.target_steps {
            let percent = (n - target) / target;
            previous_dt / (1.0 + percent)
        } else {
            let percent = (target - n) / target;
            previous_dt * (1.0 + percent / 1.2)
        }
    }

    /// 线性求解容差
    pub fn linear_tolerance(&self) -> f64 {
        self.config.tolerance * LINEAR_TOLERANCE_FACTOR
    }

    /// 求解牛顿方程 A x = b，不重试
    pub fn solve_linear(
        &self,
        solver: &mut dyn LinearSolver,
        matrix: &BlockSparseMatrix,
        x: &mut BlockVector,
        b: &BlockVector,
    ) -> FvnResult<LinearSolveReport> {
        let report = solver.solve(matrix, x, b, self.linear_tolerance())?;
        if !report.converged {
            log::warn!(
                "线性求解器 {} 未收敛: {:?}, {} 次迭代, 残差 {:.3e}",
                solver.name(),
                report.status,
                report.iterations,
                report.residual_norm
            );
        }
        Ok(report)
    }
}

impl std::fmt::Debug for NewtonController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewtonController")
            .field("policy", &self.policy.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newton::policy::PhysicalityPolicy;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn controller() -> NewtonController {
        NewtonController::new(NewtonConfig::default()).unwrap()
    }

    fn dummy() -> BlockVector {
        BlockVector::zeros(1, 1)
    }

    /// 合理度由测试脚本控制
    fn scripted() -> (NewtonController, Arc<AtomicU64>) {
        let value = Arc::new(AtomicU64::new(1.0f64.to_bits()));
        let v = Arc::clone(&value);
        let policy = PhysicalityPolicy::new(move |_: &BlockVector| f64::from_bits(v.load(Ordering::Relaxed)));
        (controller().with_policy(Box::new(policy)), value)
    }

    fn set(value: &AtomicU64, p: f64) {
        value.store(p.to_bits(), Ordering::Relaxed);
    }

    #[test]
    fn test_config_margin() {
        let bad = NewtonConfig {
            target_steps: 8,
            max_steps: 11,
            ..NewtonConfig::default()
        };
        assert!(NewtonController::new(bad).is_err());
        let bad_tol = NewtonConfig {
            tolerance: 0.0,
            ..NewtonConfig::default()
        };
        assert!(NewtonController::new(bad_tol).is_err());
    }

    #[test]
    fn test_begin_resets_state() {
        let mut c = controller();
        c.begin(0.0);
        c.end_iteration(&dummy(), 1.0);
        c.end_iteration(&dummy(), 1.0);
        assert_eq!(c.step_count(), 2);
        c.begin(4.0);
        assert_eq!(c.step_count(), 0);
        assert_eq!(c.phase(), NewtonPhase::Iterating);
        assert!((c.state().one_by_magnitude - 0.25).abs() < 1e-15);

        // 零初始解按 1e-5 归一化
        c.begin(0.0);
        assert!((c.state().one_by_magnitude - 1e5).abs() < 1e-6);
    }

    #[test]
    fn test_two_iterations_minimum() {
        let mut c = controller();
        c.begin(1.0);
        assert!(c.should_continue(&dummy()));
        c.end_iteration(&dummy(), 0.0);
        assert!(c.is_converged());
        assert!(c.should_continue(&dummy()));
        c.end_iteration(&dummy(), 0.0);
        assert!(!c.should_continue(&dummy()));
        assert_eq!(c.phase(), NewtonPhase::Converged);
    }

    #[test]
    fn test_gives_up_at_max_steps() {
        let mut c = controller();
        c.begin(1.0);
        let mut steps = 0;
        while c.should_continue(&dummy()) {
            c.end_iteration(&dummy(), 1.0);
            steps += 1;
        }
        // 第 12 步要求合理度 ≥ 12/11，不可能满足
        assert_eq!(steps, 12);
        assert_eq!(c.phase(), NewtonPhase::Failed);
        assert!(!c.is_converged());
    }

    #[test]
    fn test_abort_after_max_steps() {
        let mut c = controller();
        c.begin(1.0);
        for _ in 0..13 {
            c.end_iteration(&dummy(), 1.0);
        }
        assert!(!c.should_continue(&dummy()));
        assert_eq!(c.phase(), NewtonPhase::Aborted);
    }

    #[test]
    fn test_never_converged_below_full_physicality() {
        let (mut c, p) = scripted();
        set(&p, 0.99);
        c.begin(1.0);
        for _ in 0..3 {
            c.end_iteration(&dummy(), 0.0);
        }
        assert!(!c.is_converged());
        c.should_continue(&dummy());
        assert_ne!(c.phase(), NewtonPhase::Converged);
    }

    #[test]
    fn test_rejects_non_physical() {
        let (mut c, p) = scripted();
        c.begin(1.0);
        set(&p, 0.0);
        c.end_iteration(&dummy(), 1.0);
        c.end_iteration(&dummy(), 1.0);
        assert!(!c.should_continue(&dummy()));
        assert_eq!(c.phase(), NewtonPhase::Failed);
    }

    #[test]
    fn test_rejects_non_monotone_physicality() {
        let (mut c, p) = scripted();
        c.begin(1.0);
        // 第 6 步要求合理度 ≥ 6/11
        set(&p, 0.5);
        for _ in 0..6 {
            c.end_iteration(&dummy(), 1.0);
        }
        assert!(!c.should_continue(&dummy()));
        assert_eq!(c.phase(), NewtonPhase::Failed);
    }

    #[test]
    fn test_probation() {
        let (mut c, p) = scripted();
        c.begin(1.0);
        set(&p, 0.9);
        for _ in 0..4 {
            c.end_iteration(&dummy(), 1.0);
            assert!(c.should_continue(&dummy()));
        }
        assert!((c.max_physicality() - 0.9).abs() < 1e-15);

        // 第 5 步回落到 0.5（≥ 5/11），进入试用期
        set(&p, 0.5);
        c.end_iteration(&dummy(), 1.0);
        assert!(c.should_continue(&dummy()));
        assert_eq!(c.probation_count(), 1);

        // 再次回落，试用计数到 2，仍继续
        set(&p, 0.6);
        c.end_iteration(&dummy(), 1.0);
        assert!(c.should_continue(&dummy()));
        assert_eq!(c.probation_count(), 2);

        // 第三次回落被拒绝
        set(&p, 0.7);
        c.end_iteration(&dummy(), 1.0);
        assert!(!c.should_continue(&dummy()));
        assert_eq!(c.phase(), NewtonPhase::Failed);
    }

    #[test]
    fn test_probation_decays_by_one() {
        let (mut c, p) = scripted();
        c.begin(1.0);
        set(&p, 0.9);
        for _ in 0..3 {
            c.end_iteration(&dummy(), 1.0);
            c.should_continue(&dummy());
        }
        set(&p, 0.8);
        c.end_iteration(&dummy(), 1.0);
        c.should_continue(&dummy());
        c.end_iteration(&dummy(), 1.0);
        c.should_continue(&dummy());
        assert_eq!(c.probation_count(), 2);

        set(&p, 0.95);
        c.end_iteration(&dummy(), 1.0);
        assert!(c.should_continue(&dummy()));
        assert_eq!(c.probation_count(), 1);
        c.end_iteration(&dummy(), 1.0);
        assert!(c.should_continue(&dummy()));
        assert_eq!(c.probation_count(), 0);
    }

    #[test]
    fn test_suggest_step_size() {
        let mut c = controller();
        c.begin(1.0);
        for _ in 0..3 {
            c.end_iteration(&dummy(), 0.0);
        }
        let grown = c.suggest_next_step_size(100.0);
        assert!((grown - 100.0 * (1.0 + 5.0 / 8.0 / 1.2)).abs() < 1e-9);
        assert!(grown > 100.0);

        for _ in 0..5 {
            c.end_iteration(&dummy(), 0.0);
        }
        assert!((c.suggest_next_step_size(100.0) - 100.0).abs() < 1e-12);

        c.end_iteration(&dummy(), 0.0);
        c.end_iteration(&dummy(), 0.0);
        assert!((c.suggest_next_step_size(100.0) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_on_step_failed_shrinks_aggressively() {
        let mut c = controller();
        c.begin(1.0);
        c.on_step_failed();
        assert_eq!(c.step_count(), 16);
        assert!((c.suggest_next_step_size(1.0) - 0.5).abs() < 1e-12);
        assert_eq!(c.phase(), NewtonPhase::Failed);
    }

    #[test]
    fn test_linear_tolerance() {
        let c = controller();
        assert!((c.linear_tolerance() - 1e-13).abs() < 1e-25);
    }
}
