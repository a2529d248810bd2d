// crates/fvn_core/src/linear_algebra/block_matrix.rs

//! 块稀疏矩阵（BCSR）
//!
//! 以 (行自由度, 列自由度) 为键的稀疏块矩阵，块大小等于方程数。
//! 稀疏模式由单元→自由度映射一次性生成：同一单元内的自由度两两耦合，
//! 拓扑不变时用 `Arc` 在多个矩阵之间共享。
//!
//! 块内按行主序存储：`block[i * num_eq + j]` 是方程 i 对未知量 j 的导数。

use std::collections::BTreeSet;
use std::sync::Arc;

use fvn_foundation::{FvnError, FvnResult};

use super::block_vector::BlockVector;
use super::csr::{CsrMatrix, CsrPattern};

/// 块稀疏矩阵
#[derive(Debug, Clone)]
pub struct BlockSparseMatrix {
    num_eq: usize,
    pattern: Arc<CsrPattern>,
    values: Vec<f64>,
    recyclable: bool,
}

impl BlockSparseMatrix {
    /// 由块级稀疏模式创建零矩阵
    pub fn new(pattern: Arc<CsrPattern>, num_eq: usize) -> Self {
        let len = pattern.nnz() * num_eq * num_eq;
        Self {
            num_eq,
            pattern,
            values: vec![0.0; len],
            recyclable: false,
        }
    }

    /// 由单元连接关系构建块级稀疏模式
    ///
    /// 每个单元的自由度集合构成一个完全耦合子块；`extra` 为附加耦合
    /// （例如辅助方程与网格自由度的连接）。对角块总是存在。
    pub fn build_pattern<'a, I>(n_dofs: usize, elements: I, extra: &[(usize, usize)]) -> FvnResult<CsrPattern>
    where
        I: IntoIterator<Item = &'a [usize]>,
    {
        let mut rows: Vec<BTreeSet<usize>> = (0..n_dofs).map(|i| BTreeSet::from([i])).collect();
        for dofs in elements {
            for &i in dofs {
                FvnError::check_index("Dof", i, n_dofs)?;
                for &j in dofs {
                    rows[i].insert(j);
                }
            }
        }
        for &(i, j) in extra {
            FvnError::check_index("Dof", i, n_dofs)?;
            FvnError::check_index("Dof", j, n_dofs)?;
            rows[i].insert(j);
        }
        Ok(CsrPattern::from_rows(n_dofs, &rows))
    }

    /// 自由度数（块行数）
    #[inline]
    pub fn n_dofs(&self) -> usize {
        self.pattern.n_rows()
    }

    /// 块大小
    #[inline]
    pub fn num_eq(&self) -> usize {
        self.num_eq
    }

    /// 块级稀疏模式
    #[inline]
    pub fn pattern(&self) -> &Arc<CsrPattern> {
        &self.pattern
    }

    /// 非零块数
    #[inline]
    pub fn nnz_blocks(&self) -> usize {
        self.pattern.nnz()
    }

    /// 是否允许在后续迭代中复用本次线性化
    #[inline]
    pub fn is_recyclable(&self) -> bool {
        self.recyclable
    }

    /// 设置复用标志
    pub fn set_recyclable(&mut self, recyclable: bool) {
        self.recyclable = recyclable;
    }

    #[inline]
    fn block_len(&self) -> usize {
        self.num_eq * self.num_eq
    }

    /// 第 k 个非零块
    #[inline]
    pub fn block_at(&self, k: usize) -> &[f64] {
        let b = self.block_len();
        &self.values[k * b..(k + 1) * b]
    }

    /// 第 k 个非零块（可变）
    #[inline]
    pub fn block_at_mut(&mut self, k: usize) -> &mut [f64] {
        let b = self.block_len();
        &mut self.values[k * b..(k + 1) * b]
    }

    /// (row, col) 块
    pub fn block(&self, row: usize, col: usize) -> Option<&[f64]> {
        self.pattern.find_index(row, col).map(|k| self.block_at(k))
    }

    /// 把局部块累加到 (row, col)
    pub fn add_block(&mut self, row: usize, col: usize, local: &[f64]) -> FvnResult<()> {
        FvnError::check_size("jacobian block", self.block_len(), local.len())?;
        let k = self
            .pattern
            .find_index(row, col)
            .ok_or(FvnError::MissingMatrixEntry { row, col })?;
        for (v, &l) in self.block_at_mut(k).iter_mut().zip(local) {
            *v += l;
        }
        Ok(())
    }

    /// 全部块值（扁平）
    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// 全部块值（扁平，可变）
    #[inline]
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// 清零所有块，保留模式
    pub fn clear_values(&mut self) {
        self.values.fill(0.0);
    }

    /// y = A * x
    pub fn mul_vec(&self, x: &BlockVector, y: &mut BlockVector) -> FvnResult<()> {
        let n = self.num_eq;
        FvnError::check_size("x", self.n_dofs() * n, x.len())?;
        FvnError::check_size("y", self.n_dofs() * n, y.len())?;
        let row_ptr = self.pattern.row_ptr();
        let col_idx = self.pattern.col_idx();
        for row in 0..self.n_dofs() {
            let yr = y.block_mut(row);
            yr.fill(0.0);
            for k in row_ptr[row]..row_ptr[row + 1] {
                let xc = x.block(col_idx[k]);
                let blk = self.block_at(k);
                for i in 0..n {
                    for j in 0..n {
                        yr[i] += blk[i * n + j] * xc[j];
                    }
                }
            }
        }
        Ok(())
    }

    /// 展开为标量 CSR 矩阵（行 `dof * num_eq + eq`）
    pub fn to_scalar_csr(&self) -> CsrMatrix {
        let n = self.num_eq;
        let n_rows = self.n_dofs() * n;
        let row_ptr = self.pattern.row_ptr();
        let col_idx = self.pattern.col_idx();

        let mut rows: Vec<BTreeSet<usize>> = Vec::with_capacity(n_rows);
        let mut values = Vec::with_capacity(self.values.len());
        for row in 0..self.n_dofs() {
            for i in 0..n {
                let mut cols = BTreeSet::new();
                for k in row_ptr[row]..row_ptr[row + 1] {
                    let blk = self.block_at(k);
                    for j in 0..n {
                        cols.insert(col_idx[k] * n + j);
                        values.push(blk[i * n + j]);
                    }
                }
                rows.push(cols);
            }
        }
        CsrMatrix::from_parts(CsrPattern::from_rows(n_rows, &rows), values)
    }
}
