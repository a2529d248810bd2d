// crates/fvn_core/src/reference.rs

//! 一维非线性扩散参考算例
//!
//! ```text
//! ∂u/∂t - ∂/∂x ( D(u) ∂u/∂x ) = 0,    D(u) = 1 + s²,  s + s³ = u
//! ```
//!
//! 顶点中心（box）格式：每个区间单元把一半体积的储量项分给两端顶点，
//! 界面通量取两端扩散系数的平均值。两端为零通量边界，总量守恒。
//!
//! 中间量 s 需要一次标量牛顿迭代求解，正好用来演示中间量缓存：
//! 有效缓存直接复用，失效条目作为热启动初值。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fvn_config::NonlinearConfig;
use fvn_foundation::{FvnError, FvnResult};

use crate::assembly::{AssemblyEngine, AuxiliaryModule, ElementEvaluator, ElementInput, LocalContribution};
use crate::comm::{Communicator, SerialCommunicator};
use crate::linear_algebra::{BiCgStabSolver, BlockSparseMatrix, BlockVector};
use crate::mesh::{MeshTopology, SimpleMesh};
use crate::model::FvModel;
use crate::newton::{NewtonController, NewtonMethod, Physicality, PhysicalityPolicy};
use crate::timestep::{StepRecord, TimeStepDriver};

/// 标量牛顿迭代的最大步数
const CLOSURE_MAX_ITER: usize = 50;

/// 标量牛顿迭代的相对容差
const CLOSURE_TOL: f64 = 1e-14;

// ============================================================
// 中间量
// ============================================================

/// 每个顶点的中间量
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffusionQuantities {
    /// s + s³ = u 的实根
    pub s: f64,
    /// 扩散系数 D = 1 + s²
    pub diffusivity: f64,
    /// dD/du
    pub d_diffusivity: f64,
}

impl DiffusionQuantities {
    /// 由主变量求解，`guess` 为热启动初值
    pub fn compute(u: f64, guess: Option<f64>) -> FvnResult<Self> {
        if !u.is_finite() {
            return Err(FvnError::internal(format!("主变量非有限值: {u}")));
        }
        let mut s = guess.filter(|g| g.is_finite()).unwrap_or_else(|| {
            if u.abs() < 1.0 {
                u
            } else {
                u.cbrt()
            }
        });
        let mut converged = false;
        for _ in 0..CLOSURE_MAX_ITER {
            let f = s + s * s * s - u;
            let delta = f / (1.0 + 3.0 * s * s);
            s -= delta;
            if delta.abs() <= CLOSURE_TOL * (1.0 + s.abs()) {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(FvnError::internal(format!("u={u} 处本构关系求解不收敛")));
        }
        Ok(Self {
            s,
            diffusivity: 1.0 + s * s,
            d_diffusivity: 2.0 * s / (1.0 + 3.0 * s * s),
        })
    }
}

// ============================================================
// 单元计算
// ============================================================

/// 非线性扩散单元计算器
///
/// 单元长度取自网格（`element_volume`），网格变化后无需重建。
#[derive(Debug, Clone, Copy, Default)]
pub struct NonlinearDiffusion;

impl NonlinearDiffusion {
    fn quantities(input: &ElementInput<'_, DiffusionQuantities>, i: usize) -> FvnResult<(DiffusionQuantities, bool)> {
        if let Some(q) = input.cached[i] {
            return Ok((q, false));
        }
        let guess = input.hints[i].map(|q| q.s);
        DiffusionQuantities::compute(input.primary(i)[0], guess).map(|q| (q, true))
    }
}

impl ElementEvaluator for NonlinearDiffusion {
    type Quantities = DiffusionQuantities;

    fn num_eq(&self) -> usize {
        1
    }

    fn evaluate(
        &self,
        input: &ElementInput<'_, DiffusionQuantities>,
        out: &mut LocalContribution<DiffusionQuantities>,
    ) -> FvnResult<()> {
        if input.n_local() != 2 {
            return Err(FvnError::evaluation(
                input.element,
                format!("区间单元需要 2 个顶点, 实际 {}", input.n_local()),
            ));
        }
        let h = input.mesh.element_volume(input.element);
        if !(h > 0.0) {
            return Err(FvnError::evaluation(input.element, format!("单元长度必须为正: {h}")));
        }

        // 储量项
        if input.previous.is_some() && input.dt > 0.0 {
            let coeff = 0.5 * h / input.dt;
            for i in 0..2 {
                let u = input.primary(i)[0];
                let u_old = input.previous_primary(i).map_or(u, |p| p[0]);
                out.add_residual(i, 0, coeff * (u - u_old));
                out.add_jacobian(i, i, 0, 0, coeff);
            }
        }

        // 通量项
        let (qa, fresh_a) = Self::quantities(input, 0)?;
        let (qb, fresh_b) = Self::quantities(input, 1)?;
        let (ua, ub) = (input.primary(0)[0], input.primary(1)[0]);
        let d_face = 0.5 * (qa.diffusivity + qb.diffusivity);
        let grad = (ub - ua) / h;
        let flux = -d_face * grad;

        out.add_residual(0, 0, flux);
        out.add_residual(1, 0, -flux);

        let dflux_dua = -0.5 * qa.d_diffusivity * grad + d_face / h;
        let dflux_dub = -0.5 * qb.d_diffusivity * grad - d_face / h;
        out.add_jacobian(0, 0, 0, 0, dflux_dua);
        out.add_jacobian(0, 1, 0, 0, dflux_dub);
        out.add_jacobian(1, 0, 0, 0, -dflux_dua);
        out.add_jacobian(1, 1, 0, 0, -dflux_dub);

        if fresh_a {
            out.set_quantities(0, qa);
        }
        if fresh_b {
            out.set_quantities(1, qb);
        }

        // 上一时间层缺失的中间量（初值、回退或网格变化之后）
        if out.wants_previous_quantities() {
            for i in 0..2 {
                if input.previous_cached[i].is_some() {
                    continue;
                }
                if let Some(p) = input.previous_primary(i) {
                    let guess = input.hints[i].map(|q| q.s);
                    out.set_previous_quantities(i, DiffusionQuantities::compute(p[0], guess)?);
                }
            }
        }
        Ok(())
    }

    fn storage(
        &self,
        _dof: usize,
        volume: f64,
        primary: &[f64],
        _quantities: Option<&DiffusionQuantities>,
        out: &mut [f64],
    ) -> FvnResult<()> {
        out[0] = volume * primary[0];
        Ok(())
    }
}

// ============================================================
// 物理合理度
// ============================================================

/// 非负性：本进程负责的网格顶点中 u ≥ 0 的比例（跨分区归约）
///
/// 顶点归属随网格变化由牛顿法重新绑定。
pub struct NonNegativity {
    mesh: Arc<dyn MeshTopology>,
    comm: Arc<dyn Communicator>,
}

impl NonNegativity {
    /// 按网格的顶点归属构建
    pub fn new(mesh: Arc<dyn MeshTopology>, comm: Arc<dyn Communicator>) -> Self {
        Self { mesh, comm }
    }
}

impl Physicality for NonNegativity {
    fn physicality(&self, solution: &BlockVector) -> f64 {
        let (mut owned, mut ok) = (0usize, 0usize);
        for d in (0..self.mesh.n_dofs()).filter(|&d| self.mesh.dof_is_owned(d)) {
            owned += 1;
            // 缺失的顶点按不合理计
            if d < solution.n_dofs() && solution.block(d)[0] >= 0.0 {
                ok += 1;
            }
        }
        let ok = self.comm.sum(ok as f64);
        let total = self.comm.sum(owned as f64);
        if total > 0.0 {
            ok / total
        } else {
            1.0
        }
    }

    fn bind_mesh(&mut self, mesh: &Arc<dyn MeshTopology>) {
        self.mesh = Arc::clone(mesh);
    }
}

// ============================================================
// 探针辅助方程
// ============================================================

/// 探针：一个辅助自由度 z，满足 z = u(target)
#[derive(Debug, Clone)]
pub struct ProbeModule {
    target: usize,
    offset: usize,
}

impl ProbeModule {
    /// 监测局部网格自由度 `target`
    pub fn new(target: usize) -> Self {
        Self { target, offset: 0 }
    }

    /// 被监测的自由度
    pub fn target(&self) -> usize {
        self.target
    }
}

impl AuxiliaryModule for ProbeModule {
    fn name(&self) -> &str {
        "probe"
    }

    fn num_dofs(&self) -> usize {
        1
    }

    fn set_dof_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn dof_offset(&self) -> usize {
        self.offset
    }

    fn couplings(&self) -> Vec<(usize, usize)> {
        vec![(self.offset, self.offset), (self.offset, self.target)]
    }

    fn apply_initial(&self, solution: &mut BlockVector) {
        let value = solution.block(self.target).to_vec();
        solution.block_mut(self.offset).copy_from_slice(&value);
    }

    fn linearize(
        &self,
        solution: &BlockVector,
        residual: &mut BlockVector,
        jacobian: Option<&mut BlockSparseMatrix>,
    ) -> FvnResult<()> {
        let ne = solution.num_eq();
        for k in 0..ne {
            residual.block_mut(self.offset)[k] += solution.block(self.offset)[k] - solution.block(self.target)[k];
        }
        if let Some(jac) = jacobian {
            let mut identity = vec![0.0; ne * ne];
            for k in 0..ne {
                identity[k * ne + k] = 1.0;
            }
            jac.add_block(self.offset, self.offset, &identity)?;
            let negative: Vec<f64> = identity.iter().map(|v| -v).collect();
            jac.add_block(self.offset, self.target, &negative)?;
        }
        Ok(())
    }
}

// ============================================================
// 组装
// ============================================================

/// 初值底值与峰值之比
const BASELINE_FRACTION: f64 = 0.05;

/// 区域中心的三角形脉冲（宽度为区域长度的一半）叠加 5% 峰值的底值
pub fn initial_condition(mesh: &dyn MeshTopology, length: f64, n_cells: usize, peak: f64) -> BlockVector {
    let h = length / n_cells as f64;
    let center = 0.5 * length;
    let half_width = 0.25 * length;
    let values = (0..mesh.n_dofs())
        .map(|d| {
            let x = mesh.global_dof_index(d) as f64 * h;
            let hat = (1.0 - (x - center).abs() / half_width).max(0.0);
            peak * (BASELINE_FRACTION + (1.0 - BASELINE_FRACTION) * hat)
        })
        .collect();
    BlockVector::from_flat(1, values)
}

/// 参考算例的全部组件
pub struct DiffusionSetup {
    /// 模型（已写入初值）
    pub model: FvModel<NonlinearDiffusion>,
    /// 牛顿法（带非负性约束）
    pub newton: NewtonMethod,
    /// 时间推进驱动
    pub driver: TimeStepDriver,
}

impl DiffusionSetup {
    /// 串行构建
    pub fn new(config: &NonlinearConfig) -> FvnResult<Self> {
        Self::with_communicator(config, Arc::new(SerialCommunicator))
    }

    /// 在给定通信器的分区上构建
    pub fn with_communicator(config: &NonlinearConfig, comm: Arc<dyn Communicator>) -> FvnResult<Self> {
        config.validate().map_err(|e| FvnError::config(e.to_string()))?;
        let problem = &config.problem;
        let mesh: Arc<dyn MeshTopology> = if comm.size() > 1 {
            Arc::new(SimpleMesh::interval_partition(
                problem.n_cells,
                problem.length,
                comm.size(),
                comm.rank(),
            )?)
        } else {
            Arc::new(SimpleMesh::interval(problem.n_cells, problem.length)?)
        };

        let engine = AssemblyEngine::builder(NonlinearDiffusion, Arc::clone(&mesh))
            .config(config.assembly.clone())
            .cache_config(config.cache)
            .communicator(Arc::clone(&comm))
            .build()?;
        let mut model = FvModel::new(engine);
        model.set_initial_solution(initial_condition(
            mesh.as_ref(),
            problem.length,
            problem.n_cells,
            problem.peak,
        ))?;

        let policy = PhysicalityPolicy::named("non-negative", NonNegativity::new(Arc::clone(&mesh), comm));
        let controller = NewtonController::new(config.newton.clone())?.with_policy(Box::new(policy));
        let newton = NewtonMethod::new(controller, Box::new(BiCgStabSolver::new(config.linear.clone())));
        let driver = TimeStepDriver::new(config.time.clone())?;

        Ok(Self { model, newton, driver })
    }

    /// 推进一个时间步
    pub fn step(&mut self) -> FvnResult<StepRecord> {
        self.driver.step(&mut self.model, &mut self.newton)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_relation() {
        for &u in &[-3.0, -0.2, 0.0, 0.5, 2.0, 30.0] {
            let q = DiffusionQuantities::compute(u, None).unwrap();
            assert!((q.s + q.s.powi(3) - u).abs() < 1e-12 * (1.0 + u.abs()));
            assert!((q.diffusivity - (1.0 + q.s * q.s)).abs() < 1e-15);
        }
    }

    #[test]
    fn test_closure_derivative() {
        let u = 1.3;
        let eps = 1e-6;
        let q = DiffusionQuantities::compute(u, None).unwrap();
        let qp = DiffusionQuantities::compute(u + eps, Some(q.s)).unwrap();
        let qm = DiffusionQuantities::compute(u - eps, Some(q.s)).unwrap();
        let fd = (qp.diffusivity - qm.diffusivity) / (2.0 * eps);
        assert!((fd - q.d_diffusivity).abs() < 1e-8);
    }

    #[test]
    fn test_warm_start_gives_same_root() {
        let cold = DiffusionQuantities::compute(2.0, None).unwrap();
        let warm = DiffusionQuantities::compute(2.0, Some(0.9)).unwrap();
        assert!((cold.s - warm.s).abs() < 1e-13);
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let eval = NonlinearDiffusion;
        let mesh = SimpleMesh::interval(1, 0.1).unwrap();
        let prev = BlockVector::from_flat(1, vec![0.4, 0.1]);
        let residual_at = |u: &BlockVector, with_jac: bool| {
            let none = [None, None];
            let input = ElementInput {
                element: 0,
                dofs: &[0, 1],
                slot: 0,
                solution: u,
                previous: Some(&prev),
                mesh: &mesh,
                time: 0.01,
                dt: 0.01,
                cached: &none,
                hints: &none,
                previous_cached: &none,
            };
            let mut out = LocalContribution::new(1);
            out.reset(2, with_jac);
            eval.evaluate(&input, &mut out).unwrap();
            out
        };

        let u = BlockVector::from_flat(1, vec![0.7, 0.2]);
        let base = residual_at(&u, true);
        let eps = 1e-7;
        for j in 0..2 {
            let mut up = u.clone();
            up.block_mut(j)[0] += eps;
            let pert = residual_at(&up, false);
            for i in 0..2 {
                let fd = (pert.residual(i)[0] - base.residual(i)[0]) / eps;
                assert!((fd - base.jacobian_block(i, j)[0]).abs() < 1e-4 * (1.0 + fd.abs()));
            }
        }
    }

    #[test]
    fn test_fills_missing_previous_quantities() {
        let mesh = SimpleMesh::interval(1, 0.5).unwrap();
        let u = BlockVector::from_flat(1, vec![1.0, 2.0]);
        let prev = BlockVector::from_flat(1, vec![0.5, 3.0]);
        let old_q = DiffusionQuantities::compute(3.0, None).unwrap();
        let none = [None, None];
        let previous_cached = [None, Some(old_q)];
        let input = ElementInput {
            element: 0,
            dofs: &[0, 1],
            slot: 0,
            solution: &u,
            previous: Some(&prev),
            mesh: &mesh,
            time: 0.1,
            dt: 0.1,
            cached: &none,
            hints: &none,
            previous_cached: &previous_cached,
        };
        let mut out = LocalContribution::new(1);
        out.reset(2, false);
        out.request_previous_quantities();
        NonlinearDiffusion.evaluate(&input, &mut out).unwrap();

        let previous: Vec<_> = out.take_previous_quantities().collect();
        assert_eq!(previous.len(), 1);
        let (i, q) = previous[0];
        assert_eq!(i, 0);
        assert!((q.s + q.s.powi(3) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_initial_condition_peak() {
        let mesh = SimpleMesh::interval(8, 1.0).unwrap();
        let u0 = initial_condition(&mesh, 1.0, 8, 2.0);
        assert!((u0.block(4)[0] - 2.0).abs() < 1e-15);
        assert!((u0.block(0)[0] - 0.1).abs() < 1e-15);
        assert!((u0.block(3)[0] - 1.05).abs() < 1e-15);
    }

    #[test]
    fn test_non_negativity_fraction() {
        let mesh = SimpleMesh::interval(3, 1.0).unwrap();
        let check = NonNegativity::new(Arc::new(mesh), Arc::new(SerialCommunicator));
        let u = BlockVector::from_flat(1, vec![1.0, -0.1, 0.0, 2.0]);
        assert!((check.physicality(&u) - 0.75).abs() < 1e-15);
    }

    #[test]
    fn test_non_negativity_follows_rebound_mesh() {
        let coarse = Arc::new(SimpleMesh::interval(3, 1.0).unwrap());
        let mut check = NonNegativity::new(coarse, Arc::new(SerialCommunicator));
        let finer: Arc<dyn MeshTopology> = Arc::new(SimpleMesh::interval(5, 1.0).unwrap());
        check.bind_mesh(&finer);
        let u = BlockVector::from_flat(1, vec![1.0, -0.1, 0.0, 2.0, -1.0, 3.0]);
        assert!((check.physicality(&u) - 4.0 / 6.0).abs() < 1e-15);
    }

    #[test]
    fn test_probe_linearization() {
        let mut probe = ProbeModule::new(1);
        probe.set_dof_offset(3);
        let mut u = BlockVector::from_flat(1, vec![0.0, 5.0, 0.0, 0.0]);
        probe.apply_initial(&mut u);
        assert_eq!(u.block(3)[0], 5.0);

        u.block_mut(3)[0] = 4.0;
        let mut r = BlockVector::zeros(4, 1);
        probe.linearize(&u, &mut r, None).unwrap();
        assert!((r.block(3)[0] + 1.0).abs() < 1e-15);
    }
}
