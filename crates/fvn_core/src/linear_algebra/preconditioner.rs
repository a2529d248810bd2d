// crates/fvn_core/src/linear_algebra/preconditioner.rs

//! 预条件器
//!
//! 作用于本进程展开后的标量 CSR 矩阵：
//!
//! - [`IdentityPreconditioner`]: 不做预条件
//! - [`JacobiPreconditioner`]: 对角缩放
//! - [`Ilu0Preconditioner`]: 零填充不完全 LU 分解

use fvn_config::PreconditionerKind;

use super::csr::CsrMatrix;

/// 预条件器接口
pub trait Preconditioner: Send + Sync {
    /// z = M⁻¹ r
    fn apply(&self, r: &[f64], z: &mut [f64]);

    /// 名称
    fn name(&self) -> &'static str;
}

/// 按配置构建预条件器
pub fn build_preconditioner(kind: PreconditionerKind, matrix: &CsrMatrix) -> Box<dyn Preconditioner> {
    match kind {
        PreconditionerKind::None => Box::new(IdentityPreconditioner),
        PreconditionerKind::Jacobi => Box::new(JacobiPreconditioner::from_matrix(matrix)),
        PreconditionerKind::Ilu0 => Box::new(Ilu0Preconditioner::new(matrix)),
    }
}

// ============================================================
// Identity
// ============================================================

/// 恒等预条件器
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPreconditioner;

impl Preconditioner for IdentityPreconditioner {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        z.copy_from_slice(r);
    }

    fn name(&self) -> &'static str {
        "Identity"
    }
}

// ============================================================
// Jacobi
// ============================================================

/// Jacobi 预条件器
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner {
    inv_diag: Vec<f64>,
}

impl JacobiPreconditioner {
    /// 从矩阵对角元构建，零对角按 1 处理
    pub fn from_matrix(matrix: &CsrMatrix) -> Self {
        let inv_diag = matrix
            .diagonal()
            .into_iter()
            .map(|d| if d.abs() > 1e-14 { 1.0 / d } else { 1.0 })
            .collect();
        Self { inv_diag }
    }
}

impl Preconditioner for JacobiPreconditioner {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        for ((zi, &ri), &d) in z.iter_mut().zip(r).zip(&self.inv_diag) {
            *zi = ri * d;
        }
    }

    fn name(&self) -> &'static str {
        "Jacobi"
    }
}

// ============================================================
// ILU(0)
// ============================================================

/// ILU(0) 预条件器
///
/// L 的严格下三角和 U（含对角）共用原矩阵的稀疏模式存储。
#[derive(Debug, Clone)]
pub struct Ilu0Preconditioner {
    n: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    lu: Vec<f64>,
    diag_ptr: Vec<Option<usize>>,
}

impl Ilu0Preconditioner {
    /// 分解矩阵
    pub fn new(matrix: &CsrMatrix) -> Self {
        let n = matrix.n_rows();
        let row_ptr = matrix.row_ptr().to_vec();
        let col_idx = matrix.col_idx().to_vec();
        let diag_ptr = (0..n)
            .map(|i| (row_ptr[i]..row_ptr[i + 1]).find(|&k| col_idx[k] == i))
            .collect();

        let mut ilu = Self {
            n,
            row_ptr,
            col_idx,
            lu: matrix.values().to_vec(),
            diag_ptr,
        };
        ilu.factorize();
        ilu
    }

    fn pivot(&self, row: usize) -> f64 {
        const PIVOT_TOL: f64 = 1e-14;
        let d = self.diag_ptr[row].map(|k| self.lu[k]).unwrap_or(0.0);
        if d.abs() < PIVOT_TOL {
            if d < 0.0 { -PIVOT_TOL } else { PIVOT_TOL }
        } else {
            d
        }
    }

    fn factorize(&mut self) {
        for i in 1..self.n {
            let row_end = self.row_ptr[i + 1];
            for ki in self.row_ptr[i]..row_end {
                let k = self.col_idx[ki];
                if k >= i {
                    break;
                }
                let factor = self.lu[ki] / self.pivot(k);
                self.lu[ki] = factor;

                // a_ij -= l_ik * u_kj，只更新模式内的位置
                for ji in (ki + 1)..row_end {
                    let j = self.col_idx[ji];
                    let k_row = &self.col_idx[self.row_ptr[k]..self.row_ptr[k + 1]];
                    if let Ok(local) = k_row.binary_search(&j) {
                        let kj = self.row_ptr[k] + local;
                        self.lu[ji] -= factor * self.lu[kj];
                    }
                }
            }
        }
    }
}

impl Preconditioner for Ilu0Preconditioner {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        // L y = r（单位下三角）
        z.copy_from_slice(r);
        for i in 0..self.n {
            let mut acc = z[i];
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                let j = self.col_idx[k];
                if j >= i {
                    break;
                }
                acc -= self.lu[k] * z[j];
            }
            z[i] = acc;
        }
        // U z = y
        for i in (0..self.n).rev() {
            let mut acc = z[i];
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                let j = self.col_idx[k];
                if j > i {
                    acc -= self.lu[k] * z[j];
                }
            }
            z[i] = acc / self.pivot(i);
        }
    }

    fn name(&self) -> &'static str {
        "ILU(0)"
    }
}
