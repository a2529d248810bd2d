// crates/fvn_core/src/assembly/engine.rs

//! 残差/雅可比组装引擎
//!
//! 遍历本分区拥有的单元（跳过幽灵/重叠单元），调用单元计算器得到局部
//! 贡献，累加到全局残差与雅可比，并把新的中间量写回缓存。单元循环结束后
//! 线性化辅助方程，再跨分区求和共享自由度上的贡献。
//!
//! # 并发
//!
//! - 固定大小的 rayon 线程池处理互相独立的单元
//! - 每个工作线程一份局部缓冲区
//! - 全局累加器与缓存是唯一的共享可变状态：每个单元的合并在一把互斥锁内
//!   完成，缓存写锁在合并锁内获取
//! - 单元计算前在读锁下预取缓存内容，计算期间不持有任何锁
//!
//! 每次组装包含固定顺序的集合操作（残差归约、雅可比归约、范数归约），
//! 所有分区必须同步调用。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rayon::prelude::*;

use fvn_config::{AssemblyConfig, AssemblyStrategyKind, CacheConfig};
use fvn_foundation::{FvnError, FvnResult};

use super::evaluator::{AuxiliaryModule, ElementEvaluator, ElementInput, LocalContribution};
use crate::cache::IntensiveQuantityCache;
use crate::comm::{Communicator, DofLayout, ReduceKey, SerialCommunicator};
use crate::linear_algebra::{BlockSparseMatrix, BlockVector, CsrPattern};
use crate::mesh::MeshTopology;

// ============================================================
// 性能指标
// ============================================================

/// 组装性能指标
#[derive(Debug, Clone, Default)]
pub struct AssemblyMetrics {
    /// 总组装次数
    pub total_calls: usize,
    /// 含雅可比的组装次数
    pub jacobian_calls: usize,
    /// 并行组装次数
    pub parallel_calls: usize,
    /// 串行组装次数
    pub sequential_calls: usize,
    /// 处理的单元总数
    pub total_elements: usize,
    /// 总耗时
    pub total_duration: Duration,
}

impl AssemblyMetrics {
    /// 记录一次组装
    pub fn record(&mut self, n_elements: usize, is_parallel: bool, with_jacobian: bool, duration: Duration) {
        self.total_calls += 1;
        self.total_elements += n_elements;
        self.total_duration += duration;
        if with_jacobian {
            self.jacobian_calls += 1;
        }
        if is_parallel {
            self.parallel_calls += 1;
        } else {
            self.sequential_calls += 1;
        }
    }

    /// 重置指标
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// 平均每单元耗时
    pub fn avg_time_per_element(&self) -> Duration {
        if self.total_elements > 0 {
            self.total_duration / self.total_elements as u32
        } else {
            Duration::ZERO
        }
    }
}

// ============================================================
// 构建器
// ============================================================

/// 组装引擎构建器
pub struct AssemblyEngineBuilder<E: ElementEvaluator> {
    evaluator: E,
    mesh: Arc<dyn MeshTopology>,
    config: AssemblyConfig,
    cache_config: CacheConfig,
    comm: Arc<dyn Communicator>,
}

impl<E: ElementEvaluator> AssemblyEngineBuilder<E> {
    /// 组装配置
    pub fn config(mut self, config: AssemblyConfig) -> Self {
        self.config = config;
        self
    }

    /// 工作线程数（0 为可用核数）
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = threads;
        self
    }

    /// 组装策略
    pub fn strategy(mut self, strategy: AssemblyStrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// 缓存配置
    pub fn cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache_config = cache_config;
        self
    }

    /// 跨分区通信器
    pub fn communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.comm = comm;
        self
    }

    /// 构建引擎
    pub fn build(self) -> FvnResult<AssemblyEngine<E>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .thread_name(|i| format!("fvn-assembly-{i}"))
            .build()
            .map_err(|e| FvnError::internal(format!("无法创建组装线程池: {e}")))?;

        let n_dofs = self.mesh.n_dofs();
        let mut engine = AssemblyEngine {
            evaluator: self.evaluator,
            mesh: Arc::clone(&self.mesh),
            config: self.config,
            pool,
            owned_elements: Vec::new(),
            layout: Arc::new(DofLayout::serial(0)),
            comm: self.comm,
            cache: RwLock::new(IntensiveQuantityCache::new(self.cache_config, n_dofs)),
            pattern: Arc::new(CsrPattern::from_rows(0, &[])),
            shared_blocks: Vec::new(),
            shared_block_keys: Vec::new(),
            aux_modules: Vec::new(),
            time: 0.0,
            dt: 0.0,
            metrics: AssemblyMetrics::default(),
        };
        engine.reinit(self.mesh)?;
        Ok(engine)
    }
}

// ============================================================
// 引擎
// ============================================================

/// 全局累加器（合并锁保护）
struct Accumulators<'a> {
    residual: &'a mut BlockVector,
    jacobian: Option<&'a mut BlockSparseMatrix>,
}

/// 工作线程私有缓冲区
struct WorkerScratch<Q> {
    local: LocalContribution<Q>,
    cached: Vec<Option<Q>>,
    hints: Vec<Option<Q>>,
    previous_cached: Vec<Option<Q>>,
}

impl<Q> WorkerScratch<Q> {
    fn new(num_eq: usize) -> Self {
        Self {
            local: LocalContribution::new(num_eq),
            cached: Vec::new(),
            hints: Vec::new(),
            previous_cached: Vec::new(),
        }
    }
}

/// 单次组装的参数
#[derive(Clone, Copy)]
struct Pass {
    slot: usize,
    with_jacobian: bool,
    use_cache: bool,
}

/// 残差/雅可比组装引擎
pub struct AssemblyEngine<E: ElementEvaluator> {
    evaluator: E,
    mesh: Arc<dyn MeshTopology>,
    config: AssemblyConfig,
    pool: rayon::ThreadPool,
    owned_elements: Vec<usize>,
    layout: Arc<DofLayout>,
    comm: Arc<dyn Communicator>,
    cache: RwLock<IntensiveQuantityCache<E::Quantities>>,
    pattern: Arc<CsrPattern>,
    /// 行列都共享的块在模式中的位置及其归约键
    shared_blocks: Vec<usize>,
    shared_block_keys: Vec<ReduceKey>,
    aux_modules: Vec<Box<dyn AuxiliaryModule>>,
    time: f64,
    dt: f64,
    metrics: AssemblyMetrics,
}

impl<E: ElementEvaluator> AssemblyEngine<E> {
    /// 创建构建器（默认单分区、默认组装与缓存配置）
    pub fn builder(evaluator: E, mesh: Arc<dyn MeshTopology>) -> AssemblyEngineBuilder<E> {
        AssemblyEngineBuilder {
            evaluator,
            mesh,
            config: AssemblyConfig::default(),
            cache_config: CacheConfig::default(),
            comm: Arc::new(SerialCommunicator),
        }
    }

    // ========== 访问器 ==========

    /// 单元计算器
    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// 网格
    pub fn mesh(&self) -> &Arc<dyn MeshTopology> {
        &self.mesh
    }

    /// 自由度布局（含辅助自由度）
    pub fn layout(&self) -> &Arc<DofLayout> {
        &self.layout
    }

    /// 通信器
    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// 每个自由度的方程数
    pub fn num_eq(&self) -> usize {
        self.evaluator.num_eq()
    }

    /// 局部自由度总数（网格 + 辅助）
    pub fn n_dofs(&self) -> usize {
        self.layout.n_dofs()
    }

    /// 网格自由度数
    pub fn n_grid_dofs(&self) -> usize {
        self.mesh.n_dofs()
    }

    /// 本分区拥有的单元数
    pub fn n_owned_elements(&self) -> usize {
        self.owned_elements.len()
    }

    /// 工作线程数
    pub fn n_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// 辅助模块
    pub fn auxiliary_modules(&self) -> &[Box<dyn AuxiliaryModule>] {
        &self.aux_modules
    }

    /// 只读访问缓存
    pub fn cache(&self) -> RwLockReadGuard<'_, IntensiveQuantityCache<E::Quantities>> {
        self.cache.read()
    }

    /// 可写访问缓存（历史后移、回退、失效）
    pub fn cache_mut(&mut self) -> &mut IntensiveQuantityCache<E::Quantities> {
        self.cache.get_mut()
    }

    /// 设置当前时间与步长
    pub fn set_time(&mut self, time: f64, dt: f64) {
        self.time = time;
        self.dt = dt;
    }

    /// 当前时间
    pub fn time(&self) -> f64 {
        self.time
    }

    /// 当前步长
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// 性能指标
    pub fn metrics(&self) -> &AssemblyMetrics {
        &self.metrics
    }

    /// 重置性能指标
    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    /// 当前雅可比稀疏模式
    pub fn pattern(&self) -> &Arc<CsrPattern> {
        &self.pattern
    }

    /// 按当前模式创建雅可比矩阵
    pub fn create_matrix(&self) -> BlockSparseMatrix {
        BlockSparseMatrix::new(Arc::clone(&self.pattern), self.num_eq())
    }

    /// 按当前自由度数创建向量
    pub fn create_vector(&self) -> BlockVector {
        BlockVector::zeros(self.n_dofs(), self.num_eq())
    }

    // ========== 拓扑 ==========

    /// 网格拓扑变化后重建模式、布局与缓存
    ///
    /// 辅助模块按添加顺序重新编号；缓存全部失效。
    pub fn reinit(&mut self, mesh: Arc<dyn MeshTopology>) -> FvnResult<()> {
        self.mesh = mesh;
        self.owned_elements = (0..self.mesh.n_elements())
            .filter(|&e| self.mesh.is_owned(e))
            .collect();

        let mut layout = DofLayout::from_mesh(self.mesh.as_ref());
        let mut offset = self.mesh.n_dofs();
        for module in &mut self.aux_modules {
            module.set_dof_offset(offset);
            layout.extend_local(module.num_dofs());
            offset += module.num_dofs();
        }
        self.layout = Arc::new(layout);
        self.rebuild_pattern()?;
        self.cache.get_mut().resize(self.layout.n_dofs());

        log::debug!(
            "组装引擎初始化: {} 个自由度, {}/{} 个本分区单元, {} 个工作线程",
            self.layout.n_dofs(),
            self.owned_elements.len(),
            self.mesh.n_elements(),
            self.pool.current_num_threads()
        );
        Ok(())
    }

    /// 添加辅助模块，返回新的局部自由度总数
    ///
    /// 调用方需要相应地扩展解向量；缓存与模式随之重建。
    pub fn add_auxiliary_module(&mut self, mut module: Box<dyn AuxiliaryModule>) -> FvnResult<usize> {
        let offset = self.layout.n_dofs();
        module.set_dof_offset(offset);
        log::debug!("添加辅助模块 '{}': 自由度 {}..{}", module.name(), offset, offset + module.num_dofs());

        Arc::make_mut(&mut self.layout).extend_local(module.num_dofs());
        self.aux_modules.push(module);
        self.rebuild_pattern()?;
        self.cache.get_mut().resize(self.layout.n_dofs());
        Ok(self.layout.n_dofs())
    }

    fn rebuild_pattern(&mut self) -> FvnResult<()> {
        let n_dofs = self.layout.n_dofs();
        let extra: Vec<(usize, usize)> = self.aux_modules.iter().flat_map(|m| m.couplings()).collect();
        let mesh = &self.mesh;
        let pattern = BlockSparseMatrix::build_pattern(
            n_dofs,
            (0..mesh.n_elements()).map(|e| mesh.element_dofs(e)),
            &extra,
        )?;

        self.shared_blocks.clear();
        self.shared_block_keys.clear();
        for row in 0..pattern.n_rows() {
            if !self.layout.is_shared(row) {
                continue;
            }
            for k in pattern.row_ptr()[row]..pattern.row_ptr()[row + 1] {
                let col = pattern.col_idx()[k];
                if self.layout.is_shared(col) {
                    self.shared_blocks.push(k);
                    self.shared_block_keys
                        .push((self.layout.global_id(row), self.layout.global_id(col)));
                }
            }
        }
        self.pattern = Arc::new(pattern);
        Ok(())
    }

    // ========== 组装 ==========

    /// 计算残差，返回归约后残差的 2-范数
    ///
    /// `solutions[slot]` 为待计算的解，`solutions[slot + 1]`（若存在）为上一时间层。
    /// 新算出的中间量写入 `slot` 层；缓存开启时，上一层缺失的条目由计算器
    /// 补齐后写入 `slot + 1` 层。
    pub fn compute_residual(
        &mut self,
        solutions: &[BlockVector],
        slot: usize,
        residual: &mut BlockVector,
    ) -> FvnResult<f64> {
        let pass = Pass { slot, with_jacobian: false, use_cache: true };
        self.assemble(solutions, pass, residual, None)
    }

    /// 计算残差与雅可比，返回归约后残差的 2-范数
    pub fn compute_residual_and_jacobian(
        &mut self,
        solutions: &[BlockVector],
        slot: usize,
        residual: &mut BlockVector,
        jacobian: &mut BlockSparseMatrix,
    ) -> FvnResult<f64> {
        let pass = Pass { slot, with_jacobian: true, use_cache: true };
        let norm = self.assemble(solutions, pass, residual, Some(&mut *jacobian))?;
        jacobian.set_recyclable(self.evaluator.linearization_recyclable());
        Ok(norm)
    }

    /// 任意解的残差：不读取也不写入缓存（热启动提示除外）
    pub fn compute_residual_for(
        &mut self,
        solutions: &[BlockVector],
        slot: usize,
        residual: &mut BlockVector,
    ) -> FvnResult<f64> {
        let pass = Pass { slot, with_jacobian: false, use_cache: false };
        self.assemble(solutions, pass, residual, None)
    }

    fn check_inputs(
        &self,
        solutions: &[BlockVector],
        slot: usize,
        residual: &BlockVector,
        jacobian: Option<&BlockSparseMatrix>,
    ) -> FvnResult<()> {
        FvnError::check_index("Slot", slot, solutions.len())?;
        let n_dofs = self.n_dofs();
        self.cache.read().check_dofs(n_dofs)?;
        for u in solutions {
            FvnError::check_size("solution", n_dofs * self.num_eq(), u.len())?;
        }
        FvnError::check_size("residual", n_dofs * self.num_eq(), residual.len())?;
        if let Some(jac) = jacobian {
            let same_pattern = Arc::ptr_eq(jac.pattern(), &self.pattern) || **jac.pattern() == *self.pattern;
            if jac.num_eq() != self.num_eq() || !same_pattern {
                return Err(FvnError::size_mismatch("jacobian pattern", self.pattern.nnz(), jac.nnz_blocks()));
            }
        }
        Ok(())
    }

    fn use_parallel(&self) -> bool {
        match self.config.strategy {
            AssemblyStrategyKind::Sequential => false,
            AssemblyStrategyKind::Parallel => true,
            AssemblyStrategyKind::Auto => {
                self.owned_elements.len() >= self.config.min_parallel_elements
                    && self.pool.current_num_threads() > 1
            }
        }
    }

    fn assemble(
        &mut self,
        solutions: &[BlockVector],
        pass: Pass,
        residual: &mut BlockVector,
        mut jacobian: Option<&mut BlockSparseMatrix>,
    ) -> FvnResult<f64> {
        self.check_inputs(solutions, pass.slot, residual, jacobian.as_deref())?;
        let start = Instant::now();
        let num_eq = self.num_eq();

        residual.fill_zero();
        if let Some(jac) = jacobian.as_deref_mut() {
            jac.clear_values();
        }

        let is_parallel = self.use_parallel();
        {
            let sink = Mutex::new(Accumulators {
                residual: &mut *residual,
                jacobian: jacobian.as_deref_mut(),
            });
            let this = &*self;
            if is_parallel {
                this.pool.install(|| {
                    this.owned_elements.par_iter().try_for_each_init(
                        || WorkerScratch::new(num_eq),
                        |scratch, &e| this.process_element(e, solutions, pass, scratch, &sink),
                    )
                })?;
            } else {
                let mut scratch = WorkerScratch::new(num_eq);
                for &e in &this.owned_elements {
                    this.process_element(e, solutions, pass, &mut scratch, &sink)?;
                }
            }
        }

        let current = &solutions[pass.slot];
        for module in &self.aux_modules {
            module.linearize(current, residual, jacobian.as_deref_mut())?;
        }

        self.layout.sum_shared(self.comm.as_ref(), residual.as_mut_slice(), num_eq)?;
        if let Some(jac) = jacobian.as_deref_mut() {
            self.reduce_shared_blocks(jac)?;
        }
        let norm = self
            .layout
            .global_norm(self.comm.as_ref(), residual.as_slice(), num_eq);

        let duration = start.elapsed();
        self.metrics
            .record(self.owned_elements.len(), is_parallel, pass.with_jacobian, duration);
        log::trace!(
            "组装完成: slot={}, jacobian={}, parallel={}, |R|={:.6e}, {:?}",
            pass.slot,
            pass.with_jacobian,
            is_parallel,
            norm,
            duration
        );
        Ok(norm)
    }

    /// 计算一个单元并合并到全局累加器
    fn process_element(
        &self,
        element: usize,
        solutions: &[BlockVector],
        pass: Pass,
        scratch: &mut WorkerScratch<E::Quantities>,
        sink: &Mutex<Accumulators<'_>>,
    ) -> FvnResult<()> {
        let dofs = self.mesh.element_dofs(element);
        let WorkerScratch {
            local,
            cached,
            hints,
            previous_cached,
        } = scratch;

        cached.clear();
        hints.clear();
        previous_cached.clear();
        let store_previous;
        {
            let cache = self.cache.read();
            let has_previous = pass.slot + 1 < cache.history_size() && pass.slot + 1 < solutions.len();
            store_previous = pass.use_cache && has_previous && cache.config().enable_cache;
            for &d in dofs {
                if pass.use_cache {
                    cached.push(cache.get(pass.slot, d)?.cloned());
                } else {
                    cached.push(None);
                }
                hints.push(cache.get_hint(pass.slot, d)?.cloned());
                previous_cached.push(if has_previous {
                    cache.get(pass.slot + 1, d)?.cloned()
                } else {
                    None
                });
            }
        }

        local.reset(dofs.len(), pass.with_jacobian);
        if store_previous && previous_cached.iter().any(Option::is_none) {
            local.request_previous_quantities();
        }
        let input = ElementInput {
            element,
            dofs,
            slot: pass.slot,
            solution: &solutions[pass.slot],
            previous: solutions.get(pass.slot + 1),
            mesh: self.mesh.as_ref(),
            time: self.time,
            dt: self.dt,
            cached: cached.as_slice(),
            hints: hints.as_slice(),
            previous_cached: previous_cached.as_slice(),
        };
        self.evaluator
            .evaluate(&input, local)
            .map_err(|e| match e {
                FvnError::Evaluation { .. } => e,
                other => FvnError::evaluation(element, other.to_string()),
            })?;

        let mut acc = sink.lock();
        for (i, &d) in dofs.iter().enumerate() {
            for (dst, src) in acc.residual.block_mut(d).iter_mut().zip(local.residual(i)) {
                *dst += src;
            }
        }
        if let Some(jac) = acc.jacobian.as_deref_mut() {
            for (i, &row) in dofs.iter().enumerate() {
                for (j, &col) in dofs.iter().enumerate() {
                    jac.add_block(row, col, local.jacobian_block(i, j))?;
                }
            }
        }
        if pass.use_cache {
            let mut cache = self.cache.write();
            for (i, q) in local.take_quantities() {
                cache.update(pass.slot, dofs[i], q)?;
            }
            for (i, q) in local.take_previous_quantities() {
                cache.update(pass.slot + 1, dofs[i], q)?;
            }
        }
        Ok(())
    }

    /// 行列都共享的雅可比块跨分区求和
    fn reduce_shared_blocks(&self, jacobian: &mut BlockSparseMatrix) -> FvnResult<()> {
        let b = self.num_eq() * self.num_eq();
        let mut buffer = Vec::with_capacity(self.shared_blocks.len() * b);
        for &k in &self.shared_blocks {
            buffer.extend_from_slice(jacobian.block_at(k));
        }
        self.comm.sum_by_key(&self.shared_block_keys, &mut buffer, b)?;
        for (i, &k) in self.shared_blocks.iter().enumerate() {
            jacobian.block_at_mut(k).copy_from_slice(&buffer[i * b..(i + 1) * b]);
        }
        Ok(())
    }

    // ========== 储量 ==========

    /// 储量项的区域积分（跨分区求和）
    ///
    /// 只统计本分区负责的网格自由度；有效缓存值会传给计算器。
    pub fn global_storage(&self, solution: &BlockVector, slot: usize) -> FvnResult<Vec<f64>> {
        let num_eq = self.num_eq();
        let mut total = vec![0.0; num_eq];
        let mut local = vec![0.0; num_eq];
        {
            let cache = self.cache.read();
            for d in 0..self.mesh.n_dofs() {
                if !self.layout.is_owned(d) {
                    continue;
                }
                local.fill(0.0);
                let quantities = cache.get(slot, d)?;
                self.evaluator.storage(
                    d,
                    self.mesh.dof_volume(d),
                    solution.block(d),
                    quantities,
                    &mut local,
                )?;
                for (t, v) in total.iter_mut().zip(&local) {
                    *t += v;
                }
            }
        }
        self.comm.sum_slice(&mut total)?;
        Ok(total)
    }
}
