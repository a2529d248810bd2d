// crates/fvn_core/src/assembly/evaluator.rs

//! 单元计算接口
//!
//! 组装引擎不关心物理方程，只通过 [`ElementEvaluator`] 取得每个单元的
//! 局部残差、局部雅可比和新算出的中间量。[`AuxiliaryModule`] 描述附加在
//! 网格自由度之后的辅助方程（井、探针等）。

use fvn_foundation::{FvnError, FvnResult};

use crate::linear_algebra::{BlockSparseMatrix, BlockVector};
use crate::mesh::MeshTopology;

// ============================================================
// 单元输入
// ============================================================

/// 单元计算的输入
///
/// 缓存内容在计算前按单元自由度预取，计算期间不持有缓存锁。
pub struct ElementInput<'a, Q> {
    /// 单元编号
    pub element: usize,
    /// 单元触及的局部自由度
    pub dofs: &'a [usize],
    /// 计算的历史层
    pub slot: usize,
    /// 该层的解
    pub solution: &'a BlockVector,
    /// 上一时间层的解（slot + 1），不存在时为 None
    pub previous: Option<&'a BlockVector>,
    /// 网格
    pub mesh: &'a dyn MeshTopology,
    /// 当前时间
    pub time: f64,
    /// 时间步长
    pub dt: f64,
    /// 每个局部自由度在本层的有效缓存值
    pub cached: &'a [Option<Q>],
    /// 每个局部自由度的热启动提示
    pub hints: &'a [Option<Q>],
    /// 每个局部自由度在上一层的有效缓存值
    pub previous_cached: &'a [Option<Q>],
}

impl<'a, Q> ElementInput<'a, Q> {
    /// 单元自由度数
    #[inline]
    pub fn n_local(&self) -> usize {
        self.dofs.len()
    }

    /// 第 i 个局部自由度的主变量
    #[inline]
    pub fn primary(&self, i: usize) -> &[f64] {
        self.solution.block(self.dofs[i])
    }

    /// 第 i 个局部自由度在上一时间层的主变量
    #[inline]
    pub fn previous_primary(&self, i: usize) -> Option<&[f64]> {
        self.previous.map(|p| p.block(self.dofs[i]))
    }
}

// ============================================================
// 局部贡献
// ============================================================

/// 单元的局部贡献（每个工作线程一份，重复使用）
#[derive(Debug, Clone)]
pub struct LocalContribution<Q> {
    num_eq: usize,
    n_local: usize,
    with_jacobian: bool,
    residual: Vec<f64>,
    jacobian: Vec<f64>,
    quantities: Vec<Option<Q>>,
    with_previous: bool,
    previous_quantities: Vec<Option<Q>>,
}

impl<Q> LocalContribution<Q> {
    /// 创建空的局部缓冲区
    pub fn new(num_eq: usize) -> Self {
        Self {
            num_eq,
            n_local: 0,
            with_jacobian: false,
            residual: Vec::new(),
            jacobian: Vec::new(),
            quantities: Vec::new(),
            with_previous: false,
            previous_quantities: Vec::new(),
        }
    }

    /// 为下一个单元清零并调整尺寸
    pub fn reset(&mut self, n_local: usize, with_jacobian: bool) {
        let ne = self.num_eq;
        self.n_local = n_local;
        self.with_jacobian = with_jacobian;
        self.residual.clear();
        self.residual.resize(n_local * ne, 0.0);
        self.jacobian.clear();
        if with_jacobian {
            self.jacobian.resize(n_local * n_local * ne * ne, 0.0);
        }
        self.quantities.clear();
        self.quantities.resize_with(n_local, || None);
        self.with_previous = false;
        self.previous_quantities.clear();
        self.previous_quantities.resize_with(n_local, || None);
    }

    /// 本单元需要补齐上一时间层的中间量
    pub(crate) fn request_previous_quantities(&mut self) {
        self.with_previous = true;
    }

    /// 每个自由度的方程数
    #[inline]
    pub fn num_eq(&self) -> usize {
        self.num_eq
    }

    /// 单元自由度数
    #[inline]
    pub fn n_local(&self) -> usize {
        self.n_local
    }

    /// 本次是否需要雅可比
    #[inline]
    pub fn wants_jacobian(&self) -> bool {
        self.with_jacobian
    }

    /// 第 i 个局部自由度的残差块
    #[inline]
    pub fn residual(&self, i: usize) -> &[f64] {
        &self.residual[i * self.num_eq..(i + 1) * self.num_eq]
    }

    /// 累加残差
    #[inline]
    pub fn add_residual(&mut self, i: usize, eq: usize, value: f64) {
        self.residual[i * self.num_eq + eq] += value;
    }

    fn jacobian_offset(&self, i: usize, j: usize) -> usize {
        let b = self.num_eq * self.num_eq;
        (i * self.n_local + j) * b
    }

    /// 局部雅可比块 ∂R_i/∂u_j（行主序 num_eq × num_eq）
    pub fn jacobian_block(&self, i: usize, j: usize) -> &[f64] {
        let off = self.jacobian_offset(i, j);
        &self.jacobian[off..off + self.num_eq * self.num_eq]
    }

    /// 累加雅可比元素；不需要雅可比时忽略
    #[inline]
    pub fn add_jacobian(&mut self, i: usize, j: usize, eq: usize, var: usize, value: f64) {
        if self.with_jacobian {
            let off = self.jacobian_offset(i, j);
            self.jacobian[off + eq * self.num_eq + var] += value;
        }
    }

    /// 记录第 i 个局部自由度新算出的中间量
    pub fn set_quantities(&mut self, i: usize, quantities: Q) {
        self.quantities[i] = Some(quantities);
    }

    /// 上一时间层缓存缺失的条目是否需要由计算器补齐
    ///
    /// 只在缓存开启且存在上一层时为真；每个时间层至多补算一次。
    #[inline]
    pub fn wants_previous_quantities(&self) -> bool {
        self.with_previous
    }

    /// 记录第 i 个局部自由度在上一时间层的中间量；不需要时忽略
    pub fn set_previous_quantities(&mut self, i: usize, quantities: Q) {
        if self.with_previous {
            self.previous_quantities[i] = Some(quantities);
        }
    }

    /// 取走中间量
    pub(crate) fn take_quantities(&mut self) -> impl Iterator<Item = (usize, Q)> + '_ {
        self.quantities
            .iter_mut()
            .enumerate()
            .filter_map(|(i, q)| q.take().map(|q| (i, q)))
    }

    /// 取走上一时间层的中间量
    pub(crate) fn take_previous_quantities(&mut self) -> impl Iterator<Item = (usize, Q)> + '_ {
        self.previous_quantities
            .iter_mut()
            .enumerate()
            .filter_map(|(i, q)| q.take().map(|q| (i, q)))
    }
}

// ============================================================
// 单元计算器
// ============================================================

/// 单元计算器
pub trait ElementEvaluator: Send + Sync {
    /// 每个自由度的中间量
    type Quantities: Clone + Send + Sync;

    /// 每个自由度的方程数
    fn num_eq(&self) -> usize;

    /// 计算局部残差，`out.wants_jacobian()` 为真时同时计算局部雅可比
    fn evaluate(
        &self,
        input: &ElementInput<'_, Self::Quantities>,
        out: &mut LocalContribution<Self::Quantities>,
    ) -> FvnResult<()>;

    /// 自由度的储量项（已乘体积），用于守恒检查
    fn storage(
        &self,
        _dof: usize,
        _volume: f64,
        _primary: &[f64],
        _quantities: Option<&Self::Quantities>,
        _out: &mut [f64],
    ) -> FvnResult<()> {
        Err(FvnError::not_implemented("storage"))
    }

    /// 上一次的线性化在下一次迭代中是否仍可使用
    fn linearization_recyclable(&self) -> bool {
        false
    }
}

// ============================================================
// 辅助方程
// ============================================================

/// 辅助自由度模块
///
/// 辅助自由度排在网格自由度之后，只属于本分区。
pub trait AuxiliaryModule: Send + Sync {
    /// 名称
    fn name(&self) -> &str;

    /// 辅助自由度数
    fn num_dofs(&self) -> usize;

    /// 设置第一个辅助自由度的局部编号
    fn set_dof_offset(&mut self, offset: usize);

    /// 第一个辅助自由度的局部编号
    fn dof_offset(&self) -> usize;

    /// 额外的雅可比耦合 (行, 列)
    fn couplings(&self) -> Vec<(usize, usize)>;

    /// 写入辅助自由度的初值
    fn apply_initial(&self, solution: &mut BlockVector);

    /// 累加残差；`jacobian` 为 Some 时同时累加雅可比
    fn linearize(
        &self,
        solution: &BlockVector,
        residual: &mut BlockVector,
        jacobian: Option<&mut BlockSparseMatrix>,
    ) -> FvnResult<()>;
}
