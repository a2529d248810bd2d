// crates/fvn_core/src/mesh.rs

//! 网格拓扑接口
//!
//! 组装引擎只需要网格提供：单元列表、每个单元触及的自由度、
//! 单元是否归本进程所有，以及自由度在分区间的共享/归属信息。
//! 网格的几何与遍历细节由实现方负责。
//!
//! [`SimpleMesh`] 是基于显式连接表的实现，附带一维区间网格
//! （含一层重叠单元的分区）的构造函数。

use fvn_foundation::{FvnError, FvnResult};

/// 网格拓扑
pub trait MeshTopology: Send + Sync {
    /// 本进程可见的单元数（含重叠/幽灵单元）
    fn n_elements(&self) -> usize;

    /// 本进程的局部自由度数
    fn n_dofs(&self) -> usize;

    /// 单元触及的局部自由度
    fn element_dofs(&self, element: usize) -> &[usize];

    /// 单元是否归本进程所有（幽灵/重叠单元返回 false）
    fn is_owned(&self, _element: usize) -> bool {
        true
    }

    /// 局部自由度的全局编号
    fn global_dof_index(&self, dof: usize) -> usize {
        dof
    }

    /// 自由度是否出现在多个分区中
    fn dof_is_shared(&self, _dof: usize) -> bool {
        false
    }

    /// 自由度是否由本进程负责（共享自由度只有一个归属进程）
    fn dof_is_owned(&self, _dof: usize) -> bool {
        true
    }

    /// 自由度控制体体积
    fn dof_volume(&self, _dof: usize) -> f64 {
        1.0
    }

    /// 单元体积（一维为单元长度）
    fn element_volume(&self, _element: usize) -> f64 {
        1.0
    }
}

/// 基于连接表的网格
#[derive(Debug, Clone)]
pub struct SimpleMesh {
    n_dofs: usize,
    elem_offsets: Vec<usize>,
    elem_dofs: Vec<usize>,
    element_owned: Vec<bool>,
    global_ids: Vec<usize>,
    dof_shared: Vec<bool>,
    dof_owned: Vec<bool>,
    volumes: Vec<f64>,
    element_volumes: Vec<f64>,
}

impl SimpleMesh {
    /// 由单元→自由度连接表创建（单个分区，全部归本进程）
    pub fn new(n_dofs: usize, elements: Vec<Vec<usize>>) -> FvnResult<Self> {
        let mut elem_offsets = Vec::with_capacity(elements.len() + 1);
        let mut elem_dofs = Vec::new();
        elem_offsets.push(0);
        for dofs in &elements {
            for &d in dofs {
                FvnError::check_index("Dof", d, n_dofs)?;
            }
            elem_dofs.extend_from_slice(dofs);
            elem_offsets.push(elem_dofs.len());
        }
        Ok(Self {
            n_dofs,
            element_owned: vec![true; elements.len()],
            element_volumes: vec![1.0; elements.len()],
            elem_offsets,
            elem_dofs,
            global_ids: (0..n_dofs).collect(),
            dof_shared: vec![false; n_dofs],
            dof_owned: vec![true; n_dofs],
            volumes: vec![1.0; n_dofs],
        })
    }

    /// 设置单元归属
    pub fn with_element_ownership(mut self, owned: Vec<bool>) -> FvnResult<Self> {
        FvnError::check_size("element_owned", self.element_owned.len(), owned.len())?;
        self.element_owned = owned;
        Ok(self)
    }

    /// 设置自由度分区信息
    pub fn with_dof_partition(
        mut self,
        global_ids: Vec<usize>,
        shared: Vec<bool>,
        owned: Vec<bool>,
    ) -> FvnResult<Self> {
        FvnError::check_size("global_ids", self.n_dofs, global_ids.len())?;
        FvnError::check_size("dof_shared", self.n_dofs, shared.len())?;
        FvnError::check_size("dof_owned", self.n_dofs, owned.len())?;
        self.global_ids = global_ids;
        self.dof_shared = shared;
        self.dof_owned = owned;
        Ok(self)
    }

    /// 设置控制体体积
    pub fn with_dof_volumes(mut self, volumes: Vec<f64>) -> FvnResult<Self> {
        FvnError::check_size("dof_volumes", self.n_dofs, volumes.len())?;
        self.volumes = volumes;
        Ok(self)
    }

    /// 设置单元体积
    pub fn with_element_volumes(mut self, volumes: Vec<f64>) -> FvnResult<Self> {
        FvnError::check_size("element_volumes", self.element_volumes.len(), volumes.len())?;
        self.element_volumes = volumes;
        Ok(self)
    }

    /// 一维区间 [0, length] 上的顶点中心（box）网格
    ///
    /// 单元为区间段，自由度为顶点；端点控制体为半个单元。
    pub fn interval(n_cells: usize, length: f64) -> FvnResult<Self> {
        Self::interval_partition(n_cells, length, 1, 0)
    }

    /// 一维区间网格的第 `rank` 个分区（共 `ranks` 个）
    ///
    /// 单元按块均分；每个分区额外带一层相邻的幽灵单元。出现在多个分区
    /// 中的顶点标记为共享，归属于包含其右侧单元（末顶点取左侧单元）的分区。
    pub fn interval_partition(n_cells: usize, length: f64, ranks: usize, rank: usize) -> FvnResult<Self> {
        if n_cells == 0 || ranks == 0 || ranks > n_cells {
            return Err(FvnError::partition_mismatch(format!(
                "{n_cells} 个单元无法划分为 {ranks} 个分区"
            )));
        }
        FvnError::check_index("Rank", rank, ranks)?;

        let owned_range = |r: usize| {
            let base = n_cells / ranks;
            let rem = n_cells % ranks;
            let start = r * base + r.min(rem);
            let end = start + base + usize::from(r < rem);
            (start, end)
        };
        let local_range = |r: usize| {
            let (c0, c1) = owned_range(r);
            (c0.saturating_sub(1), (c1 + 1).min(n_cells))
        };
        let cell_owner = |cell: usize| (0..ranks).find(|&r| {
            let (c0, c1) = owned_range(r);
            cell >= c0 && cell < c1
        });

        let (c0, c1) = owned_range(rank);
        let (lc0, lc1) = local_range(rank);
        let n_local_cells = lc1 - lc0;
        let n_dofs = n_local_cells + 1;
        let h = length / n_cells as f64;

        let elements: Vec<Vec<usize>> = (0..n_local_cells).map(|e| vec![e, e + 1]).collect();
        let element_owned: Vec<bool> = (lc0..lc1).map(|c| c >= c0 && c < c1).collect();

        let mut global_ids = Vec::with_capacity(n_dofs);
        let mut shared = Vec::with_capacity(n_dofs);
        let mut owned = Vec::with_capacity(n_dofs);
        let mut volumes = Vec::with_capacity(n_dofs);
        for local in 0..n_dofs {
            let v = lc0 + local;
            let appearances = (0..ranks)
                .filter(|&r| {
                    let (a, b) = local_range(r);
                    v >= a && v <= b
                })
                .count();
            let owner = cell_owner(v.min(n_cells - 1));
            global_ids.push(v);
            shared.push(appearances > 1);
            owned.push(owner == Some(rank));
            volumes.push(if v == 0 || v == n_cells { 0.5 * h } else { h });
        }

        Self::new(n_dofs, elements)?
            .with_element_ownership(element_owned)?
            .with_dof_partition(global_ids, shared, owned)?
            .with_dof_volumes(volumes)?
            .with_element_volumes(vec![h; n_local_cells])
    }
}

impl MeshTopology for SimpleMesh {
    fn n_elements(&self) -> usize {
        self.elem_offsets.len() - 1
    }

    fn n_dofs(&self) -> usize {
        self.n_dofs
    }

    fn element_dofs(&self, element: usize) -> &[usize] {
        &self.elem_dofs[self.elem_offsets[element]..self.elem_offsets[element + 1]]
    }

    fn is_owned(&self, element: usize) -> bool {
        self.element_owned[element]
    }

    fn global_dof_index(&self, dof: usize) -> usize {
        self.global_ids[dof]
    }

    fn dof_is_shared(&self, dof: usize) -> bool {
        self.dof_shared[dof]
    }

    fn dof_is_owned(&self, dof: usize) -> bool {
        self.dof_owned[dof]
    }

    fn dof_volume(&self, dof: usize) -> f64 {
        self.volumes[dof]
    }

    fn element_volume(&self, element: usize) -> f64 {
        self.element_volumes[element]
    }
}
