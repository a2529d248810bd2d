// crates/fvn_core/src/linear_algebra/block_vector.rs

//! 块向量：每个自由度一个长度为方程数的元组

use serde::{Deserialize, Serialize};

/// 块向量
///
/// 按自由度连续存储，`block(dof)` 返回该自由度的方程元组。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockVector {
    num_eq: usize,
    data: Vec<f64>,
}

impl BlockVector {
    /// 创建零向量
    pub fn zeros(n_dofs: usize, num_eq: usize) -> Self {
        Self {
            num_eq,
            data: vec![0.0; n_dofs * num_eq],
        }
    }

    /// 由扁平数据创建
    ///
    /// # Panics
    /// `data.len()` 不是 `num_eq` 的整数倍
    pub fn from_flat(num_eq: usize, data: Vec<f64>) -> Self {
        assert!(num_eq > 0 && data.len() % num_eq == 0, "数据长度必须是方程数的整数倍");
        Self { num_eq, data }
    }

    /// 自由度数
    #[inline]
    pub fn n_dofs(&self) -> usize {
        self.data.len() / self.num_eq.max(1)
    }

    /// 方程数（块大小）
    #[inline]
    pub fn num_eq(&self) -> usize {
        self.num_eq
    }

    /// 扁平长度
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 第 dof 个块
    #[inline]
    pub fn block(&self, dof: usize) -> &[f64] {
        &self.data[dof * self.num_eq..(dof + 1) * self.num_eq]
    }

    /// 第 dof 个块（可变）
    #[inline]
    pub fn block_mut(&mut self, dof: usize) -> &mut [f64] {
        &mut self.data[dof * self.num_eq..(dof + 1) * self.num_eq]
    }

    /// 扁平视图
    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// 扁平可变视图
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// 置零
    pub fn fill_zero(&mut self) {
        self.data.fill(0.0);
    }

    /// 调整自由度数，新增块为零
    pub fn resize(&mut self, n_dofs: usize) {
        self.data.resize(n_dofs * self.num_eq, 0.0);
    }

    /// self -= other
    pub fn sub_assign(&mut self, other: &BlockVector) {
        debug_assert_eq!(self.data.len(), other.data.len());
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a -= b;
        }
    }

    /// 全部分量的二范数平方（不区分归属）
    pub fn two_norm2(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks() {
        let mut v = BlockVector::zeros(3, 2);
        assert_eq!(v.n_dofs(), 3);
        assert_eq!(v.len(), 6);
        v.block_mut(1).copy_from_slice(&[1.0, 2.0]);
        assert_eq!(v.block(1), &[1.0, 2.0]);
        assert_eq!(v.two_norm2(), 5.0);
    }

    #[test]
    fn test_resize_and_sub() {
        let mut v = BlockVector::from_flat(1, vec![3.0, 4.0]);
        v.resize(3);
        assert_eq!(v.as_slice(), &[3.0, 4.0, 0.0]);
        let w = BlockVector::from_flat(1, vec![1.0, 1.0, 1.0]);
        v.sub_assign(&w);
        assert_eq!(v.as_slice(), &[2.0, 3.0, -1.0]);
    }
}
