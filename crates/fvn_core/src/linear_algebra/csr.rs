// crates/fvn_core/src/linear_algebra/csr.rs

//! 压缩稀疏行（CSR）格式
//!
//! - [`CsrPattern`]: 只含结构的稀疏模式，块矩阵与标量矩阵共用
//! - [`CsrMatrix`]: 标量 CSR 矩阵，由块矩阵展开得到，供预条件器分解
//!
//! 列索引在每行内严格递增，查找使用二分。

use std::collections::BTreeSet;

// =============================================================================
// 稀疏模式
// =============================================================================

/// CSR 稀疏模式
///
/// 与值分离，拓扑不变时可反复复用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrPattern {
    n_rows: usize,
    n_cols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
}

impl CsrPattern {
    /// 从逐行的列集合构建
    pub fn from_rows(n_cols: usize, rows: &[BTreeSet<usize>]) -> Self {
        let nnz = rows.iter().map(|r| r.len()).sum();
        let mut row_ptr = Vec::with_capacity(rows.len() + 1);
        let mut col_idx = Vec::with_capacity(nnz);
        row_ptr.push(0);
        for row in rows {
            col_idx.extend(row.iter().copied());
            row_ptr.push(col_idx.len());
        }
        Self {
            n_rows: rows.len(),
            n_cols,
            row_ptr,
            col_idx,
        }
    }

    /// 行数
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// 列数
    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// 非零元数量
    #[inline]
    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    /// 行指针
    #[inline]
    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    /// 列索引
    #[inline]
    pub fn col_idx(&self) -> &[usize] {
        &self.col_idx
    }

    /// 第 row 行的列索引
    #[inline]
    pub fn row_indices(&self, row: usize) -> &[usize] {
        &self.col_idx[self.row_ptr[row]..self.row_ptr[row + 1]]
    }

    /// 查找 (row, col) 在值数组中的位置
    pub fn find_index(&self, row: usize, col: usize) -> Option<usize> {
        if row >= self.n_rows {
            return None;
        }
        let start = self.row_ptr[row];
        self.row_indices(row)
            .binary_search(&col)
            .ok()
            .map(|local| start + local)
    }

    /// (row, col) 是否在模式中
    #[inline]
    pub fn has_entry(&self, row: usize, col: usize) -> bool {
        self.find_index(row, col).is_some()
    }
}

// =============================================================================
// 标量 CSR 矩阵
// =============================================================================

/// 标量 CSR 矩阵
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    pattern: CsrPattern,
    values: Vec<f64>,
}

impl CsrMatrix {
    /// 由模式创建零矩阵
    pub fn zeros(pattern: CsrPattern) -> Self {
        let nnz = pattern.nnz();
        Self {
            pattern,
            values: vec![0.0; nnz],
        }
    }

    /// 由模式和值创建
    ///
    /// # Panics
    /// `values.len() != pattern.nnz()`
    pub fn from_parts(pattern: CsrPattern, values: Vec<f64>) -> Self {
        assert_eq!(values.len(), pattern.nnz(), "值数组长度必须等于非零元数");
        Self { pattern, values }
    }

    /// 行数
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.pattern.n_rows()
    }

    /// 稀疏模式
    #[inline]
    pub fn pattern(&self) -> &CsrPattern {
        &self.pattern
    }

    /// 行指针
    #[inline]
    pub fn row_ptr(&self) -> &[usize] {
        self.pattern.row_ptr()
    }

    /// 列索引
    #[inline]
    pub fn col_idx(&self) -> &[usize] {
        self.pattern.col_idx()
    }

    /// 值
    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// 可变值
    #[inline]
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// 读取 (row, col)，不在模式中返回 0
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.pattern
            .find_index(row, col)
            .map(|k| self.values[k])
            .unwrap_or(0.0)
    }

    /// 累加到 (row, col)，不在模式中返回 false
    pub fn add(&mut self, row: usize, col: usize, value: f64) -> bool {
        match self.pattern.find_index(row, col) {
            Some(k) => {
                self.values[k] += value;
                true
            }
            None => false,
        }
    }

    /// 对角元（缺失时为 0）
    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.n_rows()).map(|i| self.get(i, i)).collect()
    }

    /// y = A * x
    ///
    /// # Panics
    /// 向量长度与矩阵维度不符
    pub fn mul_vec(&self, x: &[f64], y: &mut [f64]) {
        assert_eq!(x.len(), self.pattern.n_cols(), "x 长度必须等于矩阵列数");
        assert_eq!(y.len(), self.n_rows(), "y 长度必须等于矩阵行数");
        let row_ptr = self.pattern.row_ptr();
        let col_idx = self.pattern.col_idx();
        for (row, yi) in y.iter_mut().enumerate() {
            *yi = (row_ptr[row]..row_ptr[row + 1])
                .map(|k| self.values[k] * x[col_idx[k]])
                .sum();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tridiag(n: usize) -> CsrMatrix {
        let rows: Vec<BTreeSet<usize>> = (0..n)
            .map(|i| {
                let mut s = BTreeSet::new();
                if i > 0 {
                    s.insert(i - 1);
                }
                s.insert(i);
                if i + 1 < n {
                    s.insert(i + 1);
                }
                s
            })
            .collect();
        let mut m = CsrMatrix::zeros(CsrPattern::from_rows(n, &rows));
        for i in 0..n {
            m.add(i, i, 2.0);
            if i > 0 {
                m.add(i, i - 1, -1.0);
            }
            if i + 1 < n {
                m.add(i, i + 1, -1.0);
            }
        }
        m
    }

    #[test]
    fn test_pattern_lookup() {
        let m = tridiag(4);
        assert_eq!(m.pattern().nnz(), 10);
        assert!(m.pattern().has_entry(1, 2));
        assert!(!m.pattern().has_entry(0, 3));
        assert!(m.pattern().find_index(9, 0).is_none());
    }

    #[test]
    fn test_mul_vec() {
        let m = tridiag(3);
        let x = [1.0, 2.0, 3.0];
        let mut y = [0.0; 3];
        m.mul_vec(&x, &mut y);
        assert_eq!(y, [0.0, 0.0, 4.0]);
    }

    #[test]
    fn test_add_outside_pattern() {
        let mut m = tridiag(3);
        assert!(!m.add(0, 2, 1.0));
        assert_eq!(m.get(0, 2), 0.0);
        assert_eq!(m.diagonal(), vec![2.0, 2.0, 2.0]);
    }
}
