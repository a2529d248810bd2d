// crates/fvn_core/src/model.rs

//! 有限体积模型
//!
//! 持有解的时间历史（第 0 层为当前迭代解）与组装引擎，提供时间层推进、
//! 失败回退、全局残差/储量以及辅助方程和网格变化的处理。
//! 解、残差与缓存的自由度空间始终保持一致。

use std::sync::Arc;

use fvn_foundation::{FvnError, FvnResult};

use crate::assembly::{AssemblyEngine, AuxiliaryModule, ElementEvaluator};
use crate::linear_algebra::{BlockSparseMatrix, BlockVector};
use crate::mesh::MeshTopology;

/// 有限体积模型
pub struct FvModel<E: ElementEvaluator> {
    engine: AssemblyEngine<E>,
    solutions: Vec<BlockVector>,
}

impl<E: ElementEvaluator> FvModel<E> {
    /// 创建模型，历史层数与缓存一致，解初始化为零
    pub fn new(engine: AssemblyEngine<E>) -> Self {
        let history = engine.cache().history_size();
        let solutions = (0..history).map(|_| engine.create_vector()).collect();
        Self { engine, solutions }
    }

    /// 组装引擎
    pub fn engine(&self) -> &AssemblyEngine<E> {
        &self.engine
    }

    /// 可写访问组装引擎
    pub fn engine_mut(&mut self) -> &mut AssemblyEngine<E> {
        &mut self.engine
    }

    /// 每个自由度的方程数
    pub fn num_eq(&self) -> usize {
        self.engine.num_eq()
    }

    /// 局部自由度总数
    pub fn n_dofs(&self) -> usize {
        self.engine.n_dofs()
    }

    /// 历史层数
    pub fn history_size(&self) -> usize {
        self.solutions.len()
    }

    /// 某一层的解
    ///
    /// # Panics
    ///
    /// `slot >= history_size()` 时 panic；不确定层号时用 [`Self::try_solution`]。
    pub fn solution(&self, slot: usize) -> &BlockVector {
        &self.solutions[slot]
    }

    /// 某一层的解，层号越界时返回 `IndexOutOfBounds`
    pub fn try_solution(&self, slot: usize) -> FvnResult<&BlockVector> {
        FvnError::check_index("Slot", slot, self.solutions.len())?;
        Ok(&self.solutions[slot])
    }

    /// 全部历史层
    pub fn solutions(&self) -> &[BlockVector] {
        &self.solutions
    }

    /// 可写访问某一层的解，该层缓存随之失效
    pub fn solution_mut(&mut self, slot: usize) -> FvnResult<&mut BlockVector> {
        FvnError::check_index("Slot", slot, self.solutions.len())?;
        self.engine.cache_mut().invalidate_slot(slot)?;
        Ok(&mut self.solutions[slot])
    }

    /// 设置初始解：所有历史层取同一值，辅助自由度取各模块的初值
    pub fn set_initial_solution(&mut self, initial: BlockVector) -> FvnResult<()> {
        FvnError::check_size("initial solution", self.solutions[0].len(), initial.len())?;
        for slot in &mut self.solutions {
            slot.as_mut_slice().copy_from_slice(initial.as_slice());
            for module in self.engine.auxiliary_modules() {
                module.apply_initial(slot);
            }
        }
        self.engine.cache_mut().invalidate_all();
        Ok(())
    }

    // ========== 组装 ==========

    /// 在当前解处线性化，返回残差范数
    pub fn linearize(&mut self, residual: &mut BlockVector, jacobian: &mut BlockSparseMatrix) -> FvnResult<f64> {
        self.engine
            .compute_residual_and_jacobian(&self.solutions, 0, residual, jacobian)
    }

    /// 当前解的全局残差
    pub fn global_residual(&mut self, residual: &mut BlockVector) -> FvnResult<f64> {
        self.engine.compute_residual(&self.solutions, 0, residual)
    }

    /// 任意解的全局残差，不影响当前解与缓存
    pub fn global_residual_for(&mut self, u: &BlockVector, residual: &mut BlockVector) -> FvnResult<f64> {
        FvnError::check_size("solution", self.solutions[0].len(), u.len())?;
        let mut tmp = u.clone();
        std::mem::swap(&mut self.solutions[0], &mut tmp);
        let result = self.engine.compute_residual_for(&self.solutions, 0, residual);
        std::mem::swap(&mut self.solutions[0], &mut tmp);
        result
    }

    /// 某一层储量项的区域积分
    pub fn global_storage(&self, slot: usize) -> FvnResult<Vec<f64>> {
        self.engine.global_storage(self.try_solution(slot)?, slot)
    }

    /// 当前层相对上一层的储量变化
    pub fn storage_change(&self) -> FvnResult<Vec<f64>> {
        let current = self.global_storage(0)?;
        let previous = self.global_storage(1)?;
        Ok(current.iter().zip(&previous).map(|(c, p)| c - p).collect())
    }

    /// 网格自由度的总体积（跨分区求和）
    pub fn grid_total_volume(&self) -> FvnResult<f64> {
        let mesh = self.engine.mesh();
        let layout = self.engine.layout();
        let local: f64 = (0..mesh.n_dofs())
            .filter(|&d| layout.is_owned(d))
            .map(|d| mesh.dof_volume(d))
            .sum();
        Ok(self.engine.comm().sum(local))
    }

    /// 牛顿更新 u ← u - dx，第 0 层缓存失效
    pub fn apply_update(&mut self, update: &BlockVector) -> FvnResult<()> {
        FvnError::check_size("update", self.solutions[0].len(), update.len())?;
        self.solutions[0].sub_assign(update);
        self.engine.cache_mut().invalidate_slot(0)
    }

    // ========== 时间层 ==========

    /// 在当前解处重新计算第 0 层的中间量
    ///
    /// 最后一次牛顿更新使第 0 层失效；推进时间层前刷新，接受的解的中间量
    /// 才能作为上一层缓存和下一步的热启动提示。缓存与提示都关闭时不做任何事。
    pub fn refresh_quantities(&mut self) -> FvnResult<()> {
        if !self.engine.cache().config().stores_quantities() {
            return Ok(());
        }
        let mut residual = self.engine.create_vector();
        self.engine.compute_residual(&self.solutions, 0, &mut residual)?;
        Ok(())
    }

    /// 时间步成功：历史后移一层
    pub fn advance_time_level(&mut self) -> FvnResult<()> {
        if self.solutions.len() < 2 {
            return Err(FvnError::cache_misuse("推进时间层需要至少两个历史层"));
        }
        self.engine.cache_mut().shift_history(1)?;
        for k in (1..self.solutions.len()).rev() {
            let (head, tail) = self.solutions.split_at_mut(k);
            tail[0].as_mut_slice().copy_from_slice(head[k - 1].as_slice());
        }
        Ok(())
    }

    /// 时间步失败：当前解恢复为上一层，缓存第 0 层同步回退
    pub fn update_failed(&mut self) -> FvnResult<()> {
        if self.solutions.len() < 2 {
            return Err(FvnError::cache_misuse("回退需要至少两个历史层"));
        }
        let (head, tail) = self.solutions.split_at_mut(1);
        head[0].as_mut_slice().copy_from_slice(tail[0].as_slice());
        self.engine.cache_mut().rollback()
    }

    // ========== 拓扑 ==========

    /// 添加辅助方程模块，解向量随之扩展并写入模块初值
    pub fn add_auxiliary_module(&mut self, module: Box<dyn AuxiliaryModule>) -> FvnResult<()> {
        let n_dofs = self.engine.add_auxiliary_module(module)?;
        for slot in &mut self.solutions {
            slot.resize(n_dofs);
        }
        if let Some(module) = self.engine.auxiliary_modules().last() {
            for slot in &mut self.solutions {
                module.apply_initial(slot);
            }
        }
        Ok(())
    }

    /// 网格变化后重建引擎，解向量按新自由度数截断或补零
    ///
    /// 调用方负责随后写入新网格上的解（`solution_mut`）。
    pub fn grid_changed(&mut self, mesh: Arc<dyn MeshTopology>) -> FvnResult<()> {
        self.engine.reinit(mesh)?;
        let n_dofs = self.engine.n_dofs();
        for slot in &mut self.solutions {
            slot.resize(n_dofs);
            for module in self.engine.auxiliary_modules() {
                module.apply_initial(slot);
            }
        }
        log::debug!("网格变化: 新自由度数 {n_dofs}");
        Ok(())
    }
}
