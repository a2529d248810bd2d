// crates/fvn_core/src/newton/method.rs

//! 牛顿法主循环
//!
//! ```text
//! begin ─► should_continue? ─► 组装 R, J ─► 解 J dx = R ─► u -= dx ─► end_iteration
//!               ▲                                                      │
//!               └──────────────────────────────────────────────────────┘
//! ```
//!
//! 不收敛与线性求解失败都作为 [`NewtonOutcome::Failed`] 返回，
//! 由时间推进驱动缩小步长重试；只有配置/缓存类错误返回 `Err`。

use std::fmt;
use std::sync::Arc;

use fvn_config::DefectMeasure;
use fvn_foundation::FvnResult;

use super::controller::{NewtonController, NewtonPhase};
use crate::assembly::ElementEvaluator;
use crate::linear_algebra::{BlockSparseMatrix, BlockVector, LinearSolver, SolverStatus};
use crate::model::FvModel;

/// 可恢复的失败原因
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepFailure {
    /// 超过步数上限或被合理度策略拒绝
    NonConvergence {
        /// 停止时已完成的迭代步数
        steps: usize,
        /// 停止时的控制器阶段
        phase: NewtonPhase,
    },
    /// 线性求解未收敛
    LinearSolveFailure {
        /// 发生失败的牛顿步
        step: usize,
        /// 线性求解器状态
        status: SolverStatus,
    },
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::NonConvergence { steps, phase } => {
                write!(f, "牛顿迭代 {steps} 步后停止 ({phase:?})")
            }
            StepFailure::LinearSolveFailure { step, status } => {
                write!(f, "第 {step} 步线性求解失败 ({status:?})")
            }
        }
    }
}

/// 一次非线性求解的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NewtonOutcome {
    /// 收敛
    Converged {
        /// 迭代步数
        steps: usize,
    },
    /// 可恢复的失败
    Failed(StepFailure),
}

impl NewtonOutcome {
    /// 是否收敛
    pub fn is_converged(&self) -> bool {
        matches!(self, NewtonOutcome::Converged { .. })
    }
}

/// 牛顿法
pub struct NewtonMethod {
    controller: NewtonController,
    solver: Box<dyn LinearSolver>,
    residual: BlockVector,
    update: BlockVector,
    jacobian: Option<BlockSparseMatrix>,
    last_residual_norm: f64,
    total_linearizations: usize,
}

impl NewtonMethod {
    /// 创建
    pub fn new(controller: NewtonController, solver: Box<dyn LinearSolver>) -> Self {
        Self {
            controller,
            solver,
            residual: BlockVector::zeros(0, 1),
            update: BlockVector::zeros(0, 1),
            jacobian: None,
            last_residual_norm: f64::NAN,
            total_linearizations: 0,
        }
    }

    /// 控制器
    pub fn controller(&self) -> &NewtonController {
        &self.controller
    }

    /// 可写访问控制器
    pub fn controller_mut(&mut self) -> &mut NewtonController {
        &mut self.controller
    }

    /// 最近一次组装的残差范数
    pub fn last_residual_norm(&self) -> f64 {
        self.last_residual_norm
    }

    /// 累计完整线性化次数
    pub fn total_linearizations(&self) -> usize {
        self.total_linearizations
    }

    /// 按模型的自由度与模式准备工作向量和矩阵，并重新绑定网格与分区
    ///
    /// 每次 [`Self::apply`] 开始时自动调用；网格变化后也可单独调用。
    pub fn prepare<E: ElementEvaluator>(&mut self, model: &FvModel<E>) {
        let engine = model.engine();
        if self.residual.len() != model.n_dofs() * model.num_eq() || self.residual.num_eq() != model.num_eq() {
            self.residual = engine.create_vector();
            self.update = engine.create_vector();
        }
        let stale = match &self.jacobian {
            Some(j) => !Arc::ptr_eq(j.pattern(), engine.pattern()) || j.num_eq() != model.num_eq(),
            None => true,
        };
        if stale {
            self.jacobian = Some(engine.create_matrix());
        }
        self.solver
            .bind_partition(Arc::clone(engine.layout()), Arc::clone(engine.comm()));
        self.controller.bind_mesh(engine.mesh());
    }

    /// 在模型当前解上执行牛顿迭代
    ///
    /// 收敛时第 0 层为新解；失败时第 0 层为最后的迭代解，由调用方回退。
    pub fn apply<E: ElementEvaluator>(&mut self, model: &mut FvModel<E>) -> FvnResult<NewtonOutcome> {
        self.prepare(model);
        let num_eq = model.num_eq();
        let initial_norm = {
            let engine = model.engine();
            engine
                .layout()
                .global_norm(engine.comm().as_ref(), model.solution(0).as_slice(), num_eq)
        };
        self.controller.begin(initial_norm);

        let mut jacobian = match self.jacobian.take() {
            Some(j) => j,
            None => model.engine().create_matrix(),
        };
        let result = self.iterate(model, &mut jacobian);
        self.jacobian = Some(jacobian);
        result
    }

    fn iterate<E: ElementEvaluator>(
        &mut self,
        model: &mut FvModel<E>,
        jacobian: &mut BlockSparseMatrix,
    ) -> FvnResult<NewtonOutcome> {
        let num_eq = model.num_eq();
        let mut reuse_jacobian = false;

        while self.controller.should_continue(model.solution(0)) {
            let norm = if reuse_jacobian {
                model.global_residual(&mut self.residual)?
            } else {
                self.total_linearizations += 1;
                model.linearize(&mut self.residual, jacobian)?
            };
            self.last_residual_norm = norm;

            self.update.fill_zero();
            let report = self.controller.solve_linear(
                self.solver.as_mut(),
                jacobian,
                &mut self.update,
                &self.residual,
            )?;
            if !report.converged {
                let failure = StepFailure::LinearSolveFailure {
                    step: self.controller.step_count(),
                    status: report.status,
                };
                self.controller.on_step_failed();
                return Ok(NewtonOutcome::Failed(failure));
            }

            model.apply_update(&self.update)?;

            let defect = match self.controller.config().defect {
                DefectMeasure::Update => {
                    let engine = model.engine();
                    engine
                        .layout()
                        .global_norm(engine.comm().as_ref(), self.update.as_slice(), num_eq)
                }
                DefectMeasure::Residual => norm,
            };
            self.controller.end_iteration(model.solution(0), defect);
            reuse_jacobian = jacobian.is_recyclable();
        }

        match self.controller.phase() {
            NewtonPhase::Converged => Ok(NewtonOutcome::Converged {
                steps: self.controller.step_count(),
            }),
            phase => {
                let failure = StepFailure::NonConvergence {
                    steps: self.controller.step_count(),
                    phase,
                };
                self.controller.on_step_failed();
                Ok(NewtonOutcome::Failed(failure))
            }
        }
    }
}

impl fmt::Debug for NewtonMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewtonMethod")
            .field("controller", &self.controller)
            .field("solver", &self.solver.name())
            .field("total_linearizations", &self.total_linearizations)
            .finish()
    }
}
