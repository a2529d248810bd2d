// crates/fvn_core/src/linear_algebra/solver.rs

//! 线性求解器
//!
//! 牛顿控制器只把线性求解当作 `solve(A, x, b, rtol) -> converged` 使用。
//! 默认实现是带预条件的 BiCGStab，可在区域分解下运行：
//!
//! - 矩阵为各分区组装并完成共享块归约后的局部矩阵
//! - 矩阵-向量乘：局部乘积中，两端都共享的块按持有它的分区数加权，
//!   再对共享行求和，得到与单分区一致的结果
//! - 内积只统计本分区负责的自由度
//! - 预条件：局部 ILU(0)/Jacobi 后以归属分区的值覆盖共享自由度
//!   （限制型加性 Schwarz）
//!
//! 单分区时以上步骤退化为普通的预条件 BiCGStab。

use std::sync::Arc;

use fvn_config::LinearSolverConfig;
use fvn_foundation::{FvnError, FvnResult};

use super::block_matrix::BlockSparseMatrix;
use super::block_vector::BlockVector;
use super::csr::CsrMatrix;
use super::preconditioner::{build_preconditioner, Preconditioner};
use super::vector_ops::{axpy, copy};
use crate::comm::{Communicator, DofLayout, ReduceKey, SerialCommunicator};

/// 求解器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    /// 收敛
    Converged,
    /// 达到最大迭代次数
    MaxIterationsReached,
    /// 发散
    Diverged,
    /// 停滞（Krylov 子空间崩溃）
    Stagnated,
}

/// 线性求解报告
#[derive(Debug, Clone, Copy)]
pub struct LinearSolveReport {
    /// 是否收敛
    pub converged: bool,
    /// 状态
    pub status: SolverStatus,
    /// 迭代次数
    pub iterations: usize,
    /// 初始残差范数
    pub initial_residual_norm: f64,
    /// 最终残差范数
    pub residual_norm: f64,
}

impl LinearSolveReport {
    fn new(status: SolverStatus, iterations: usize, initial: f64, last: f64) -> Self {
        Self {
            converged: status == SolverStatus::Converged,
            status,
            iterations,
            initial_residual_norm: initial,
            residual_norm: last,
        }
    }
}

/// 线性求解器接口
pub trait LinearSolver: Send {
    /// 求解 A x = b，`rtol` 为相对残差容差
    ///
    /// 不收敛通过报告返回；尺寸不一致等配置错误返回 `Err`。
    fn solve(
        &mut self,
        matrix: &BlockSparseMatrix,
        x: &mut BlockVector,
        b: &BlockVector,
        rtol: f64,
    ) -> FvnResult<LinearSolveReport>;

    /// 绑定分区信息，拓扑或辅助自由度变化后需要重新绑定
    fn bind_partition(&mut self, _layout: Arc<DofLayout>, _comm: Arc<dyn Communicator>) {}

    /// 名称
    fn name(&self) -> &'static str;
}

// ============================================================
// 分布式算子
// ============================================================

/// 某一次求解使用的分布式线性算子
struct DistributedOperator<'a> {
    num_eq: usize,
    layout: &'a DofLayout,
    comm: &'a dyn Communicator,
    weighted: CsrMatrix,
    precond: Box<dyn Preconditioner>,
}

impl<'a> DistributedOperator<'a> {
    fn new(
        matrix: &BlockSparseMatrix,
        layout: &'a DofLayout,
        comm: &'a dyn Communicator,
        config: &LinearSolverConfig,
    ) -> FvnResult<Self> {
        FvnError::check_size("layout", matrix.n_dofs(), layout.n_dofs())?;
        let num_eq = matrix.num_eq();
        let local = matrix.to_scalar_csr();
        let precond = build_preconditioner(config.preconditioner, &local);

        let mut weighted = local;
        if layout.has_shared() || comm.size() > 1 {
            let weights = Self::shared_block_weights(matrix, layout, comm)?;
            let b = num_eq * num_eq;
            // 标量 CSR 与块值的顺序不同，按 (块行, 块内行, 块, 块内列) 重新定位
            let pattern = matrix.pattern();
            let mut pos = 0;
            for row in 0..matrix.n_dofs() {
                for _i in 0..num_eq {
                    for k in pattern.row_ptr()[row]..pattern.row_ptr()[row + 1] {
                        let w = weights[k];
                        for _j in 0..num_eq {
                            weighted.values_mut()[pos] *= w;
                            pos += 1;
                        }
                    }
                }
            }
            debug_assert_eq!(pos, matrix.nnz_blocks() * b);
        }

        Ok(Self {
            num_eq,
            layout,
            comm,
            weighted,
            precond,
        })
    }

    /// 两端都共享的块的权重 1/m，m 为持有该块的分区数；其余块权重为 1
    fn shared_block_weights(
        matrix: &BlockSparseMatrix,
        layout: &DofLayout,
        comm: &dyn Communicator,
    ) -> FvnResult<Vec<f64>> {
        let pattern = matrix.pattern();
        let mut weights = vec![1.0; pattern.nnz()];
        let mut keys: Vec<ReduceKey> = Vec::new();
        let mut slots = Vec::new();
        for row in 0..pattern.n_rows() {
            if !layout.is_shared(row) {
                continue;
            }
            for k in pattern.row_ptr()[row]..pattern.row_ptr()[row + 1] {
                let col = pattern.col_idx()[k];
                if layout.is_shared(col) {
                    keys.push((layout.global_id(row), layout.global_id(col)));
                    slots.push(k);
                }
            }
        }
        let mut counts = vec![1.0; keys.len()];
        comm.sum_by_key(&keys, &mut counts, 1)?;
        for (&k, &m) in slots.iter().zip(&counts) {
            weights[k] = 1.0 / m;
        }
        Ok(weights)
    }

    /// y = A x（x 在共享自由度上必须一致）
    fn apply(&mut self, x: &[f64], y: &mut [f64]) -> FvnResult<()> {
        self.weighted.mul_vec(x, y);
        self.layout.sum_shared(self.comm, y, self.num_eq)
    }

    /// z = M⁻¹ r
    fn precondition(&mut self, r: &[f64], z: &mut [f64]) -> FvnResult<()> {
        self.precond.apply(r, z);
        if self.layout.has_shared() || self.comm.size() > 1 {
            self.layout.copy_owner_values(self.comm, z, self.num_eq)?;
        }
        Ok(())
    }

    fn dot(&self, x: &[f64], y: &[f64]) -> f64 {
        self.layout.global_dot(self.comm, x, y, self.num_eq)
    }

    fn norm(&self, x: &[f64]) -> f64 {
        self.dot(x, x).sqrt()
    }
}

// ============================================================
// BiCGStab
// ============================================================

/// BiCGStab 工作区
#[derive(Debug, Clone, Default)]
struct BiCgStabWorkspace {
    r: Vec<f64>,
    r0: Vec<f64>,
    p: Vec<f64>,
    v: Vec<f64>,
    s: Vec<f64>,
    t: Vec<f64>,
    z: Vec<f64>,
}

impl BiCgStabWorkspace {
    fn resize(&mut self, n: usize) {
        for v in [
            &mut self.r,
            &mut self.r0,
            &mut self.p,
            &mut self.v,
            &mut self.s,
            &mut self.t,
            &mut self.z,
        ] {
            v.clear();
            v.resize(n, 0.0);
        }
    }
}

/// 预条件 BiCGStab 求解器
pub struct BiCgStabSolver {
    config: LinearSolverConfig,
    layout: Option<Arc<DofLayout>>,
    comm: Arc<dyn Communicator>,
    ws: BiCgStabWorkspace,
}

impl BiCgStabSolver {
    /// 创建单分区求解器
    pub fn new(config: LinearSolverConfig) -> Self {
        Self {
            config,
            layout: None,
            comm: Arc::new(SerialCommunicator),
            ws: BiCgStabWorkspace::default(),
        }
    }

    /// 配置
    pub fn config(&self) -> &LinearSolverConfig {
        &self.config
    }

    fn run(
        &mut self,
        op: &mut DistributedOperator<'_>,
        x: &mut [f64],
        b: &[f64],
        rtol: f64,
    ) -> FvnResult<LinearSolveReport> {
        const BREAKDOWN: f64 = 1e-300;
        const DIVERGENCE_FACTOR: f64 = 1e6;

        let n = b.len();
        let atol = self.config.atol;
        let ws = &mut self.ws;
        ws.resize(n);

        // r = b - A x
        op.apply(x, &mut ws.r)?;
        for (ri, &bi) in ws.r.iter_mut().zip(b) {
            *ri = bi - *ri;
        }
        let initial = op.norm(&ws.r);
        if initial <= atol {
            return Ok(LinearSolveReport::new(SolverStatus::Converged, 0, initial, initial));
        }
        copy(&ws.r, &mut ws.r0);

        let mut rho_old = 1.0;
        let mut alpha = 1.0;
        let mut omega = 1.0;
        let mut res_norm = initial;

        for iter in 0..self.config.max_iter {
            let rho = op.dot(&ws.r0, &ws.r);
            if rho.abs() < BREAKDOWN {
                return Ok(LinearSolveReport::new(SolverStatus::Stagnated, iter, initial, res_norm));
            }
            let beta = if iter == 0 { 0.0 } else { (rho / rho_old) * (alpha / omega) };
            rho_old = rho;

            // p = r + beta (p - omega v)
            for i in 0..n {
                ws.p[i] = ws.r[i] + beta * (ws.p[i] - omega * ws.v[i]);
            }

            // v = A M⁻¹ p
            op.precondition(&ws.p, &mut ws.z)?;
            op.apply(&ws.z, &mut ws.v)?;
            let r0v = op.dot(&ws.r0, &ws.v);
            if r0v.abs() < BREAKDOWN {
                return Ok(LinearSolveReport::new(SolverStatus::Stagnated, iter, initial, res_norm));
            }
            alpha = rho / r0v;
            axpy(alpha, &ws.z, x);

            // s = r - alpha v
            for i in 0..n {
                ws.s[i] = ws.r[i] - alpha * ws.v[i];
            }
            let s_norm = op.norm(&ws.s);
            if s_norm <= atol || s_norm <= rtol * initial {
                return Ok(LinearSolveReport::new(SolverStatus::Converged, iter + 1, initial, s_norm));
            }

            // t = A M⁻¹ s
            op.precondition(&ws.s, &mut ws.z)?;
            op.apply(&ws.z, &mut ws.t)?;
            let tt = op.dot(&ws.t, &ws.t);
            omega = if tt.abs() < BREAKDOWN { 0.0 } else { op.dot(&ws.t, &ws.s) / tt };
            if omega.abs() < BREAKDOWN {
                return Ok(LinearSolveReport::new(SolverStatus::Stagnated, iter + 1, initial, s_norm));
            }
            axpy(omega, &ws.z, x);

            // r = s - omega t
            for i in 0..n {
                ws.r[i] = ws.s[i] - omega * ws.t[i];
            }
            res_norm = op.norm(&ws.r);
            log::trace!("BiCGStab iter {}: residual = {:.6e}", iter + 1, res_norm);

            if res_norm <= atol || res_norm <= rtol * initial {
                return Ok(LinearSolveReport::new(SolverStatus::Converged, iter + 1, initial, res_norm));
            }
            if res_norm > DIVERGENCE_FACTOR * initial {
                return Ok(LinearSolveReport::new(SolverStatus::Diverged, iter + 1, initial, res_norm));
            }
        }

        Ok(LinearSolveReport::new(
            SolverStatus::MaxIterationsReached,
            self.config.max_iter,
            initial,
            res_norm,
        ))
    }
}

impl LinearSolver for BiCgStabSolver {
    fn solve(
        &mut self,
        matrix: &BlockSparseMatrix,
        x: &mut BlockVector,
        b: &BlockVector,
        rtol: f64,
    ) -> FvnResult<LinearSolveReport> {
        let n = matrix.n_dofs() * matrix.num_eq();
        FvnError::check_size("rhs", n, b.len())?;
        FvnError::check_size("solution", n, x.len())?;

        let layout = match &self.layout {
            Some(layout) => Arc::clone(layout),
            None => Arc::new(DofLayout::serial(matrix.n_dofs())),
        };
        let comm = Arc::clone(&self.comm);
        let mut op = DistributedOperator::new(matrix, &layout, comm.as_ref(), &self.config)?;
        self.run(&mut op, x.as_mut_slice(), b.as_slice(), rtol)
    }

    fn bind_partition(&mut self, layout: Arc<DofLayout>, comm: Arc<dyn Communicator>) {
        self.layout = Some(layout);
        self.comm = comm;
    }

    fn name(&self) -> &'static str {
        "BiCGStab"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadGroupCommunicator;
    use crate::mesh::{MeshTopology, SimpleMesh};
    use fvn_config::PreconditionerKind;
    use std::thread;

    /// 组装 (M + K) u = b 的一维质量+刚度系统，只统计本分区拥有的单元，
    /// 并完成共享块与共享行的归约
    fn assemble(mesh: &SimpleMesh, comm: &dyn Communicator) -> (BlockSparseMatrix, BlockVector, DofLayout) {
        let n = mesh.n_dofs();
        let elements: Vec<Vec<usize>> = (0..mesh.n_elements()).map(|e| mesh.element_dofs(e).to_vec()).collect();
        let pattern = BlockSparseMatrix::build_pattern(n, elements.iter().map(|e| e.as_slice()), &[]).unwrap();
        let mut a = BlockSparseMatrix::new(Arc::new(pattern), 1);
        let mut b = BlockVector::zeros(n, 1);
        let h = 0.1;
        for (e, dofs) in elements.iter().enumerate() {
            if !mesh.is_owned(e) {
                continue;
            }
            let (i, j) = (dofs[0], dofs[1]);
            a.add_block(i, i, &[0.5 * h + 1.0 / h]).unwrap();
            a.add_block(j, j, &[0.5 * h + 1.0 / h]).unwrap();
            a.add_block(i, j, &[-1.0 / h]).unwrap();
            a.add_block(j, i, &[-1.0 / h]).unwrap();
            let xi = mesh.global_dof_index(i) as f64 * h;
            b.block_mut(i)[0] += 0.5 * h * (1.0 + xi);
            b.block_mut(j)[0] += 0.5 * h * (1.0 + xi + h);
        }
        let layout = DofLayout::from_mesh(mesh);
        layout.sum_shared(comm, b.as_mut_slice(), 1).unwrap();

        let pattern = Arc::clone(a.pattern());
        let mut keys = Vec::new();
        let mut slots = Vec::new();
        for row in 0..n {
            for k in pattern.row_ptr()[row]..pattern.row_ptr()[row + 1] {
                let col = pattern.col_idx()[k];
                if layout.is_shared(row) && layout.is_shared(col) {
                    keys.push((layout.global_id(row), layout.global_id(col)));
                    slots.push(k);
                }
            }
        }
        let mut vals: Vec<f64> = slots.iter().map(|&k| a.block_at(k)[0]).collect();
        comm.sum_by_key(&keys, &mut vals, 1).unwrap();
        for (&k, &v) in slots.iter().zip(&vals) {
            a.block_at_mut(k)[0] = v;
        }
        (a, b, layout)
    }

    #[test]
    fn test_serial_bicgstab_ilu0() {
        let mesh = SimpleMesh::interval(10, 1.0).unwrap();
        let (a, b, _) = assemble(&mesh, &SerialCommunicator);
        let mut x = BlockVector::zeros(11, 1);
        let mut solver = BiCgStabSolver::new(LinearSolverConfig::default());
        let report = solver.solve(&a, &mut x, &b, 1e-12).unwrap();
        assert!(report.converged);

        let mut ax = BlockVector::zeros(11, 1);
        a.mul_vec(&x, &mut ax).unwrap();
        for (l, r) in ax.as_slice().iter().zip(b.as_slice()) {
            assert!((l - r).abs() < 1e-10);
        }
    }

    #[test]
    fn test_jacobi_and_identity_converge() {
        let mesh = SimpleMesh::interval(10, 1.0).unwrap();
        let (a, b, _) = assemble(&mesh, &SerialCommunicator);
        for kind in [PreconditionerKind::Jacobi, PreconditionerKind::None] {
            let config = LinearSolverConfig {
                preconditioner: kind,
                ..LinearSolverConfig::default()
            };
            let mut x = BlockVector::zeros(11, 1);
            let report = BiCgStabSolver::new(config).solve(&a, &mut x, &b, 1e-10).unwrap();
            assert!(report.converged, "{kind:?}");
        }
    }

    #[test]
    fn test_zero_rhs_converges_immediately() {
        let mesh = SimpleMesh::interval(4, 1.0).unwrap();
        let (a, _, _) = assemble(&mesh, &SerialCommunicator);
        let b = BlockVector::zeros(5, 1);
        let mut x = BlockVector::zeros(5, 1);
        let report = BiCgStabSolver::new(LinearSolverConfig::default()).solve(&a, &mut x, &b, 1e-13).unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn test_size_mismatch_is_error() {
        let mesh = SimpleMesh::interval(4, 1.0).unwrap();
        let (a, b, _) = assemble(&mesh, &SerialCommunicator);
        let mut x = BlockVector::zeros(3, 1);
        assert!(BiCgStabSolver::new(LinearSolverConfig::default()).solve(&a, &mut x, &b, 1e-8).is_err());
    }

    #[test]
    fn test_two_rank_solve_matches_serial() {
        let mesh = SimpleMesh::interval(10, 1.0).unwrap();
        let (a, b, _) = assemble(&mesh, &SerialCommunicator);
        let mut reference = BlockVector::zeros(11, 1);
        BiCgStabSolver::new(LinearSolverConfig::default())
            .solve(&a, &mut reference, &b, 1e-13)
            .unwrap();

        let group = ThreadGroupCommunicator::group(2);
        let parts: Vec<Vec<(usize, f64)>> = thread::scope(|s| {
            let handles: Vec<_> = group
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mesh = SimpleMesh::interval_partition(10, 1.0, 2, comm.rank()).unwrap();
                        let (a, b, layout) = assemble(&mesh, &comm);
                        let mut solver = BiCgStabSolver::new(LinearSolverConfig::default());
                        solver.bind_partition(Arc::new(layout), Arc::new(comm));
                        let mut x = BlockVector::zeros(mesh.n_dofs(), 1);
                        let report = solver.solve(&a, &mut x, &b, 1e-13).unwrap();
                        assert!(report.converged);
                        (0..mesh.n_dofs())
                            .map(|d| (mesh.global_dof_index(d), x.block(d)[0]))
                            .collect()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for part in parts {
            for (gid, value) in part {
                assert!((value - reference.block(gid)[0]).abs() < 1e-9);
            }
        }
    }
}
