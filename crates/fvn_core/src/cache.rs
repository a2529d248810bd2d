// crates/fvn_core/src/cache.rs

//! 中间量缓存
//!
//! 按 (历史层, 自由度) 存储昂贵的本构中间量及其有效标记。
//! 只有有效条目会作为权威值返回；失效条目保留下来，可作为热启动提示
//! 或诊断数据。
//!
//! 历史层 0 总是最新的时间层。时间推进时整体后移一层，
//! 失败回退时用第 1 层覆盖第 0 层。
//!
//! 越界的层号或自由度号属于编程/配置错误，返回 `CacheMisuse`。

use serde::{Deserialize, Serialize};

use fvn_config::CacheConfig;
use fvn_foundation::{FvnError, FvnResult};

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry<Q> {
    value: Option<Q>,
    up_to_date: bool,
}

impl<Q> Default for CacheEntry<Q> {
    fn default() -> Self {
        Self {
            value: None,
            up_to_date: false,
        }
    }
}

/// 缓存快照（用于检查点）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot<Q> {
    /// 历史层数
    pub history_size: usize,
    /// 自由度数
    pub n_dofs: usize,
    /// 每层每个自由度的 (值, 是否有效)
    pub slots: Vec<Vec<(Option<Q>, bool)>>,
}

/// 中间量缓存
#[derive(Debug, Clone)]
pub struct IntensiveQuantityCache<Q> {
    config: CacheConfig,
    n_dofs: usize,
    slots: Vec<Vec<CacheEntry<Q>>>,
}

impl<Q: Clone> IntensiveQuantityCache<Q> {
    /// 创建缓存，所有条目失效
    pub fn new(config: CacheConfig, n_dofs: usize) -> Self {
        let history = config.history_size.max(1);
        Self {
            config,
            n_dofs,
            slots: (0..history).map(|_| Self::empty_slot(n_dofs)).collect(),
        }
    }

    fn empty_slot(n_dofs: usize) -> Vec<CacheEntry<Q>> {
        (0..n_dofs).map(|_| CacheEntry::default()).collect()
    }

    /// 配置
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 自由度数
    #[inline]
    pub fn n_dofs(&self) -> usize {
        self.n_dofs
    }

    /// 历史层数
    #[inline]
    pub fn history_size(&self) -> usize {
        self.slots.len()
    }

    fn check(&self, slot: usize, dof: usize) -> FvnResult<()> {
        if slot >= self.slots.len() {
            return Err(FvnError::cache_misuse(format!(
                "历史层 {slot} 超出范围 0..{}",
                self.slots.len()
            )));
        }
        if dof >= self.n_dofs {
            return Err(FvnError::cache_misuse(format!(
                "自由度 {dof} 超出范围 0..{}，自由度数变化后需先 resize",
                self.n_dofs
            )));
        }
        Ok(())
    }

    fn check_slot(&self, slot: usize) -> FvnResult<()> {
        if slot >= self.slots.len() {
            return Err(FvnError::cache_misuse(format!(
                "历史层 {slot} 超出范围 0..{}",
                self.slots.len()
            )));
        }
        Ok(())
    }

    /// 检查缓存与外部自由度空间是否同步
    pub fn check_dofs(&self, n_dofs: usize) -> FvnResult<()> {
        if n_dofs != self.n_dofs {
            return Err(FvnError::cache_misuse(format!(
                "缓存自由度数 {} 与系统自由度数 {n_dofs} 不一致",
                self.n_dofs
            )));
        }
        Ok(())
    }

    /// 有效的缓存值；缓存关闭或条目失效时返回 `None`
    pub fn get(&self, slot: usize, dof: usize) -> FvnResult<Option<&Q>> {
        self.check(slot, dof)?;
        if !self.config.enable_cache {
            return Ok(None);
        }
        let entry = &self.slots[slot][dof];
        Ok(if entry.up_to_date { entry.value.as_ref() } else { None })
    }

    /// 热启动提示
    ///
    /// 先看请求的层，再按 0, 1, … 的顺序返回第一个有效条目。
    /// 提示可能来自其他时间层，只能作为初值使用。
    pub fn get_hint(&self, slot: usize, dof: usize) -> FvnResult<Option<&Q>> {
        self.check(slot, dof)?;
        if !self.config.enable_hints {
            return Ok(None);
        }
        let requested = &self.slots[slot][dof];
        if requested.up_to_date {
            return Ok(requested.value.as_ref());
        }
        Ok(self
            .slots
            .iter()
            .map(|s| &s[dof])
            .find(|e| e.up_to_date && e.value.is_some())
            .and_then(|e| e.value.as_ref()))
    }

    /// 写入并标记有效；缓存与提示都关闭时不存储
    pub fn update(&mut self, slot: usize, dof: usize, value: Q) -> FvnResult<()> {
        self.check(slot, dof)?;
        if !self.config.stores_quantities() {
            return Ok(());
        }
        self.slots[slot][dof] = CacheEntry {
            value: Some(value),
            up_to_date: true,
        };
        Ok(())
    }

    /// 强制设置有效标记，值不变
    pub fn invalidate(&mut self, slot: usize, dof: usize, valid: bool) -> FvnResult<()> {
        self.check(slot, dof)?;
        if !self.config.stores_quantities() {
            return Ok(());
        }
        self.slots[slot][dof].up_to_date = valid;
        Ok(())
    }

    /// 整层失效（该层的解发生变化时调用）
    pub fn invalidate_slot(&mut self, slot: usize) -> FvnResult<()> {
        self.check_slot(slot)?;
        self.slots[slot].iter_mut().for_each(|e| e.up_to_date = false);
        Ok(())
    }

    /// 全部失效
    pub fn invalidate_all(&mut self) {
        for slot in &mut self.slots {
            slot.iter_mut().for_each(|e| e.up_to_date = false);
        }
    }

    /// 历史后移 `num_slots` 层：第 k 层移到第 k+num_slots 层，随后第 0 层整体失效
    ///
    /// 被移出的最后几层丢弃；第 0 层保留原值作为提示来源。
    pub fn shift_history(&mut self, num_slots: usize) -> FvnResult<()> {
        let history = self.slots.len();
        if num_slots == 0 || num_slots >= history {
            return Err(FvnError::cache_misuse(format!(
                "后移层数 {num_slots} 必须在 1..{history} 内"
            )));
        }
        if !self.config.stores_quantities() {
            return Ok(());
        }
        for k in (0..history - num_slots).rev() {
            let moved = self.slots[k].clone();
            self.slots[k + num_slots] = moved;
        }
        self.slots[0].iter_mut().for_each(|e| e.up_to_date = false);
        Ok(())
    }

    /// 失败回退：第 0 层（值与有效标记）恢复为第 1 层
    pub fn rollback(&mut self) -> FvnResult<()> {
        if self.slots.len() < 2 {
            return Err(FvnError::cache_misuse("回退需要至少两个历史层"));
        }
        let previous = self.slots[1].clone();
        self.slots[0] = previous;
        Ok(())
    }

    /// 重新分配到新的自由度数，全部条目失效
    pub fn resize(&mut self, n_dofs: usize) {
        self.n_dofs = n_dofs;
        for slot in &mut self.slots {
            *slot = Self::empty_slot(n_dofs);
        }
    }

    /// 某层有效条目数
    pub fn up_to_date_count(&self, slot: usize) -> FvnResult<usize> {
        self.check_slot(slot)?;
        Ok(self.slots[slot].iter().filter(|e| e.up_to_date).count())
    }

    /// 导出快照
    pub fn snapshot(&self) -> CacheSnapshot<Q> {
        CacheSnapshot {
            history_size: self.slots.len(),
            n_dofs: self.n_dofs,
            slots: self
                .slots
                .iter()
                .map(|s| s.iter().map(|e| (e.value.clone(), e.up_to_date)).collect())
                .collect(),
        }
    }

    /// 从快照恢复，历史层数与自由度数必须一致
    pub fn restore(&mut self, snapshot: CacheSnapshot<Q>) -> FvnResult<()> {
        if snapshot.history_size != self.slots.len() || snapshot.slots.len() != self.slots.len() {
            return Err(FvnError::cache_misuse(format!(
                "快照历史层数 {} 与缓存 {} 不一致",
                snapshot.history_size,
                self.slots.len()
            )));
        }
        self.check_dofs(snapshot.n_dofs)?;
        if snapshot.slots.iter().any(|s| s.len() != self.n_dofs) {
            return Err(FvnError::cache_misuse("快照层长度与自由度数不一致"));
        }
        self.slots = snapshot
            .slots
            .into_iter()
            .map(|s| {
                s.into_iter()
                    .map(|(value, up_to_date)| CacheEntry { value, up_to_date })
                    .collect()
            })
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(n: usize) -> IntensiveQuantityCache<f64> {
        IntensiveQuantityCache::new(CacheConfig::default(), n)
    }

    #[test]
    fn test_update_get_invalidate() {
        let mut c = cache(8);
        c.update(0, 5, 2.5).unwrap();
        assert_eq!(c.get(0, 5).unwrap(), Some(&2.5));

        c.invalidate(0, 5, false).unwrap();
        assert_eq!(c.get(0, 5).unwrap(), None);
        // 第 1 层也没有有效值
        assert_eq!(c.get_hint(0, 5).unwrap(), None);

        c.update(1, 5, 1.5).unwrap();
        assert_eq!(c.get_hint(0, 5).unwrap(), Some(&1.5));

        // 重新标记有效，原值还在
        c.invalidate(0, 5, true).unwrap();
        assert_eq!(c.get(0, 5).unwrap(), Some(&2.5));
    }

    #[test]
    fn test_hint_prefers_requested_slot() {
        let mut c = cache(2);
        c.update(0, 0, 1.0).unwrap();
        c.update(1, 0, 2.0).unwrap();
        assert_eq!(c.get_hint(1, 0).unwrap(), Some(&2.0));
        c.invalidate(1, 0, false).unwrap();
        assert_eq!(c.get_hint(1, 0).unwrap(), Some(&1.0));
    }

    #[test]
    fn test_disabled_cache_keeps_hints() {
        let config = CacheConfig {
            enable_cache: false,
            ..CacheConfig::default()
        };
        let mut c = IntensiveQuantityCache::new(config, 2);
        c.update(0, 1, 3.0).unwrap();
        assert_eq!(c.get(0, 1).unwrap(), None);
        assert_eq!(c.get_hint(0, 1).unwrap(), Some(&3.0));
    }

    #[test]
    fn test_fully_disabled_is_noop() {
        let config = CacheConfig {
            enable_cache: false,
            enable_hints: false,
            history_size: 2,
        };
        let mut c = IntensiveQuantityCache::new(config, 2);
        c.update(0, 1, 3.0).unwrap();
        assert_eq!(c.up_to_date_count(0).unwrap(), 0);
        assert_eq!(c.get_hint(0, 1).unwrap(), None);
    }

    #[test]
    fn test_shift_history() {
        let mut c = cache(3);
        c.update(0, 0, 10.0).unwrap();
        c.update(0, 2, 12.0).unwrap();
        c.shift_history(1).unwrap();

        assert_eq!(c.get(0, 0).unwrap(), None);
        assert_eq!(c.get(1, 0).unwrap(), Some(&10.0));
        assert_eq!(c.get(1, 1).unwrap(), None);
        assert_eq!(c.get(1, 2).unwrap(), Some(&12.0));
        // 第 0 层失效但可从第 1 层拿到提示
        assert_eq!(c.get_hint(0, 0).unwrap(), Some(&10.0));
    }

    #[test]
    fn test_shift_longer_history() {
        let config = CacheConfig {
            history_size: 3,
            ..CacheConfig::default()
        };
        let mut c = IntensiveQuantityCache::new(config, 1);
        c.update(0, 0, 1.0).unwrap();
        c.update(1, 0, 2.0).unwrap();
        c.shift_history(1).unwrap();
        assert_eq!(c.get(1, 0).unwrap(), Some(&1.0));
        assert_eq!(c.get(2, 0).unwrap(), Some(&2.0));
        assert!(c.shift_history(3).is_err());
    }

    #[test]
    fn test_shift_then_resize_invalidates_everything() {
        let mut c = cache(4);
        for d in 0..4 {
            c.update(0, d, d as f64).unwrap();
            c.update(1, d, d as f64).unwrap();
        }
        c.shift_history(1).unwrap();
        c.resize(4);
        for slot in 0..2 {
            for d in 0..4 {
                assert_eq!(c.get(slot, d).unwrap(), None);
                assert_eq!(c.get_hint(slot, d).unwrap(), None);
            }
        }
    }

    #[test]
    fn test_rollback() {
        let mut c = cache(2);
        c.update(1, 0, 7.0).unwrap();
        c.update(0, 0, 9.0).unwrap();
        c.update(0, 1, 8.0).unwrap();
        c.rollback().unwrap();
        assert_eq!(c.get(0, 0).unwrap(), Some(&7.0));
        assert_eq!(c.get(0, 1).unwrap(), None);
    }

    #[test]
    fn test_out_of_range_is_misuse() {
        let mut c = cache(2);
        assert!(c.get(0, 2).unwrap_err().is_cache_misuse());
        assert!(c.get_hint(2, 0).unwrap_err().is_cache_misuse());
        assert!(c.update(0, 9, 1.0).is_err());
        assert!(c.check_dofs(3).is_err());
        c.resize(3);
        assert!(c.check_dofs(3).is_ok());
        assert!(c.get(0, 2).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut c = cache(2);
        c.update(0, 1, 4.0).unwrap();
        let snap = c.snapshot();
        let mut other = cache(2);
        other.restore(snap.clone()).unwrap();
        assert_eq!(other.get(0, 1).unwrap(), Some(&4.0));

        let mut wrong = cache(3);
        assert!(wrong.restore(snap).is_err());
    }
}
