// crates/fvn_core/src/comm.rs

//! 跨进程通信
//!
//! 区域分解时，每个分区独立组装自己的单元贡献，共享自由度上的部分和
//! 通过一次阻塞式集合归约补全。本模块提供：
//!
//! - [`Communicator`]: 集合归约接口
//! - [`SerialCommunicator`]: 单分区实现（所有归约为恒等）
//! - [`ThreadGroupCommunicator`]: 同一进程内以线程模拟多个分区
//! - [`DofLayout`]: 局部自由度的全局编号、共享与归属标记
//!
//! 所有集合操作必须由组内每个成员以相同顺序调用。

use std::collections::HashMap;
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use fvn_foundation::{FvnError, FvnResult};

use crate::mesh::MeshTopology;

/// 归约键：矩阵元素为 (全局行, 全局列)，向量元素为 (全局自由度, 全局自由度)
pub type ReduceKey = (usize, usize);

/// 集合归约接口
pub trait Communicator: Send + Sync {
    /// 本成员编号
    fn rank(&self) -> usize;

    /// 成员总数
    fn size(&self) -> usize;

    /// 收集每个成员的一个标量，按成员编号排列
    fn all_gather(&self, value: f64) -> Vec<f64>;

    /// 逐元素求和（各成员切片长度必须相同）
    fn sum_slice(&self, values: &mut [f64]) -> FvnResult<()>;

    /// 按键求和：对每个键，把所有持有该键的成员的值相加后写回
    ///
    /// `values` 每 `stride` 个值对应 `keys` 中的一个键。
    fn sum_by_key(&self, keys: &[ReduceKey], values: &mut [f64], stride: usize) -> FvnResult<()>;

    /// 标量求和（按成员编号顺序累加，各成员结果逐位一致）
    fn sum(&self, value: f64) -> f64 {
        self.all_gather(value).iter().sum()
    }
}

fn check_keyed(keys: &[ReduceKey], values: &[f64], stride: usize) -> FvnResult<()> {
    FvnError::check_size("keyed values", keys.len() * stride, values.len())
}

// ============================================================
// 串行
// ============================================================

/// 单分区通信器
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, value: f64) -> Vec<f64> {
        vec![value]
    }

    fn sum_slice(&self, _values: &mut [f64]) -> FvnResult<()> {
        Ok(())
    }

    fn sum_by_key(&self, keys: &[ReduceKey], values: &mut [f64], stride: usize) -> FvnResult<()> {
        check_keyed(keys, values, stride)
    }
}

// ============================================================
// 线程组
// ============================================================

#[derive(Default)]
struct Deposit {
    keys: Vec<ReduceKey>,
    values: Vec<f64>,
    stride: usize,
}

struct Exchange {
    barrier: Barrier,
    slots: Vec<Mutex<Deposit>>,
}

impl Exchange {
    /// 存入本成员数据，等待全员到齐后读取全部数据，再等待全员读完
    fn round<R>(&self, rank: usize, deposit: Deposit, read: impl FnOnce(&[Mutex<Deposit>]) -> R) -> R {
        *self.slots[rank].lock() = deposit;
        self.barrier.wait();
        let result = read(&self.slots);
        self.barrier.wait();
        result
    }
}

/// 进程内线程组通信器
///
/// 用 `group(n)` 创建 n 个句柄，每个分区线程持有一个。
/// 每次集合操作包含两个屏障：写入后一次，读取后一次。
#[derive(Clone)]
pub struct ThreadGroupCommunicator {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

impl ThreadGroupCommunicator {
    /// 创建 n 个成员的通信组
    pub fn group(n: usize) -> Vec<Self> {
        let size = n.max(1);
        let exchange = Arc::new(Exchange {
            barrier: Barrier::new(size),
            slots: (0..size).map(|_| Mutex::new(Deposit::default())).collect(),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }
}

impl std::fmt::Debug for ThreadGroupCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroupCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Communicator for ThreadGroupCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather(&self, value: f64) -> Vec<f64> {
        let deposit = Deposit {
            values: vec![value],
            ..Deposit::default()
        };
        self.exchange.round(self.rank, deposit, |slots| {
            slots.iter().map(|s| s.lock().values.first().copied().unwrap_or(0.0)).collect()
        })
    }

    fn sum_slice(&self, values: &mut [f64]) -> FvnResult<()> {
        let deposit = Deposit {
            values: values.to_vec(),
            ..Deposit::default()
        };
        let len = values.len();
        let summed = self.exchange.round(self.rank, deposit, |slots| {
            let mut acc = vec![0.0; len];
            for slot in slots {
                let slot = slot.lock();
                if slot.values.len() != len {
                    return Err(FvnError::partition_mismatch(format!(
                        "sum_slice 长度不一致: {} vs {}",
                        slot.values.len(),
                        len
                    )));
                }
                for (a, v) in acc.iter_mut().zip(&slot.values) {
                    *a += v;
                }
            }
            Ok(acc)
        })?;
        values.copy_from_slice(&summed);
        Ok(())
    }

    fn sum_by_key(&self, keys: &[ReduceKey], values: &mut [f64], stride: usize) -> FvnResult<()> {
        let local_ok = check_keyed(keys, values, stride);
        // 尺寸错误也要参与本轮交换，避免其他成员在屏障处等待
        let deposit = Deposit {
            keys: if local_ok.is_ok() { keys.to_vec() } else { Vec::new() },
            values: if local_ok.is_ok() { values.to_vec() } else { Vec::new() },
            stride,
        };
        let index: HashMap<ReduceKey, usize> = keys.iter().enumerate().map(|(i, &k)| (k, i)).collect();
        let summed = self.exchange.round(self.rank, deposit, |slots| {
            let mut acc = vec![0.0; values.len()];
            for slot in slots {
                let slot = slot.lock();
                if !slot.keys.is_empty() && slot.stride != stride {
                    return Err(FvnError::partition_mismatch(format!(
                        "sum_by_key 步长不一致: {} vs {}",
                        slot.stride, stride
                    )));
                }
                for (i, key) in slot.keys.iter().enumerate() {
                    if let Some(&mine) = index.get(key) {
                        let src = &slot.values[i * stride..(i + 1) * stride];
                        for (a, v) in acc[mine * stride..(mine + 1) * stride].iter_mut().zip(src) {
                            *a += v;
                        }
                    }
                }
            }
            Ok(acc)
        });
        local_ok?;
        values.copy_from_slice(&summed?);
        Ok(())
    }
}

// ============================================================
// 自由度布局
// ============================================================

/// 局部自由度布局
///
/// 记录每个局部自由度的全局编号、是否共享、是否由本分区负责。
/// 范数和内积只统计本分区负责的自由度，保证每个共享自由度只计一次。
#[derive(Debug, Clone, PartialEq)]
pub struct DofLayout {
    global_ids: Vec<usize>,
    shared: Vec<bool>,
    owned: Vec<bool>,
    shared_dofs: Vec<usize>,
    shared_keys: Vec<ReduceKey>,
}

impl DofLayout {
    /// 单分区布局：全部自由度归本分区、不共享
    pub fn serial(n_dofs: usize) -> Self {
        Self::from_parts((0..n_dofs).collect(), vec![false; n_dofs], vec![true; n_dofs])
    }

    /// 从网格拓扑读取
    pub fn from_mesh(mesh: &dyn MeshTopology) -> Self {
        let n = mesh.n_dofs();
        Self::from_parts(
            (0..n).map(|d| mesh.global_dof_index(d)).collect(),
            (0..n).map(|d| mesh.dof_is_shared(d)).collect(),
            (0..n).map(|d| mesh.dof_is_owned(d)).collect(),
        )
    }

    fn from_parts(global_ids: Vec<usize>, shared: Vec<bool>, owned: Vec<bool>) -> Self {
        let shared_dofs: Vec<usize> = (0..shared.len()).filter(|&d| shared[d]).collect();
        let shared_keys = shared_dofs.iter().map(|&d| (global_ids[d], global_ids[d])).collect();
        Self {
            global_ids,
            shared,
            owned,
            shared_dofs,
            shared_keys,
        }
    }

    /// 追加 `count` 个仅属于本分区的自由度（辅助方程）
    pub fn extend_local(&mut self, count: usize) {
        let start = self.global_ids.len();
        self.global_ids.extend(start..start + count);
        self.shared.extend(std::iter::repeat(false).take(count));
        self.owned.extend(std::iter::repeat(true).take(count));
    }

    /// 局部自由度数
    #[inline]
    pub fn n_dofs(&self) -> usize {
        self.global_ids.len()
    }

    /// 全局编号
    #[inline]
    pub fn global_id(&self, dof: usize) -> usize {
        self.global_ids[dof]
    }

    /// 是否共享
    #[inline]
    pub fn is_shared(&self, dof: usize) -> bool {
        self.shared[dof]
    }

    /// 是否由本分区负责
    #[inline]
    pub fn is_owned(&self, dof: usize) -> bool {
        self.owned[dof]
    }

    /// 共享自由度的局部编号
    #[inline]
    pub fn shared_dofs(&self) -> &[usize] {
        &self.shared_dofs
    }

    /// 是否存在共享自由度
    #[inline]
    pub fn has_shared(&self) -> bool {
        !self.shared_dofs.is_empty()
    }

    /// 对共享自由度上的块求和（长度 `n_dofs * num_eq` 的扁平向量）
    pub fn sum_shared(&self, comm: &dyn Communicator, values: &mut [f64], num_eq: usize) -> FvnResult<()> {
        FvnError::check_size("shared vector", self.n_dofs() * num_eq, values.len())?;
        let mut buffer = Vec::with_capacity(self.shared_dofs.len() * num_eq);
        for &d in &self.shared_dofs {
            buffer.extend_from_slice(&values[d * num_eq..(d + 1) * num_eq]);
        }
        comm.sum_by_key(&self.shared_keys, &mut buffer, num_eq)?;
        for (i, &d) in self.shared_dofs.iter().enumerate() {
            values[d * num_eq..(d + 1) * num_eq].copy_from_slice(&buffer[i * num_eq..(i + 1) * num_eq]);
        }
        Ok(())
    }

    /// 以归属分区的值覆盖共享自由度
    pub fn copy_owner_values(&self, comm: &dyn Communicator, values: &mut [f64], num_eq: usize) -> FvnResult<()> {
        for &d in &self.shared_dofs {
            if !self.owned[d] {
                values[d * num_eq..(d + 1) * num_eq].fill(0.0);
            }
        }
        self.sum_shared(comm, values, num_eq)
    }

    /// 本分区负责的自由度上的局部内积
    pub fn owned_dot(&self, x: &[f64], y: &[f64], num_eq: usize) -> f64 {
        let mut acc = 0.0;
        for (d, &owned) in self.owned.iter().enumerate() {
            if owned {
                let r = d * num_eq..(d + 1) * num_eq;
                acc += x[r.clone()].iter().zip(&y[r]).map(|(a, b)| a * b).sum::<f64>();
            }
        }
        acc
    }

    /// 全局内积
    pub fn global_dot(&self, comm: &dyn Communicator, x: &[f64], y: &[f64], num_eq: usize) -> f64 {
        comm.sum(self.owned_dot(x, y, num_eq))
    }

    /// 全局二范数
    pub fn global_norm(&self, comm: &dyn Communicator, x: &[f64], num_eq: usize) -> f64 {
        self.global_dot(comm, x, x, num_eq).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::SimpleMesh;
    use std::thread;

    #[test]
    fn test_serial_is_identity() {
        let comm = SerialCommunicator;
        assert_eq!(comm.sum(3.5), 3.5);
        let mut v = vec![1.0, 2.0];
        comm.sum_by_key(&[(0, 0)], &mut v, 2).unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
        assert!(comm.sum_by_key(&[(0, 0)], &mut v, 3).is_err());
    }

    #[test]
    fn test_thread_group_sum() {
        let group = ThreadGroupCommunicator::group(3);
        let results: Vec<f64> = thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|c| s.spawn(move || c.sum(c.rank() as f64 + 1.0)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![6.0, 6.0, 6.0]);
    }

    #[test]
    fn test_thread_group_sum_by_key() {
        let group = ThreadGroupCommunicator::group(2);
        let results: Vec<Vec<f64>> = thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        // 键 (1,1) 两个成员都有，(0,0) 只在 rank 0，(2,2) 只在 rank 1
                        let (keys, mut values) = if c.rank() == 0 {
                            (vec![(0, 0), (1, 1)], vec![1.0, 10.0])
                        } else {
                            (vec![(1, 1), (2, 2)], vec![20.0, 5.0])
                        };
                        c.sum_by_key(&keys, &mut values, 1).unwrap();
                        values
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0], vec![1.0, 30.0]);
        assert_eq!(results[1], vec![30.0, 5.0]);
    }

    #[test]
    fn test_layout_owned_norm_counts_shared_once() {
        let group = ThreadGroupCommunicator::group(2);
        let norms: Vec<f64> = thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let mesh = SimpleMesh::interval_partition(10, 1.0, 2, c.rank()).unwrap();
                        let layout = DofLayout::from_mesh(&mesh);
                        let ones = vec![1.0; layout.n_dofs()];
                        layout.global_norm(c, &ones, 1)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for n in norms {
            assert!((n - 11.0_f64.sqrt()).abs() < 1e-14);
        }
    }

    #[test]
    fn test_extend_local() {
        let mut layout = DofLayout::serial(3);
        layout.extend_local(2);
        assert_eq!(layout.n_dofs(), 5);
        assert!(layout.is_owned(4));
        assert!(!layout.is_shared(4));
        assert!(!layout.has_shared());
    }
}
