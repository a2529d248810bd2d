// crates/fvn_core/src/checkpoint.rs

//! 检查点保存/恢复
//!
//! 保存时间推进状态、解的全部历史层、控制器步数与中间量缓存，
//! 续算时从检查点恢复后牛顿迭代的热启动提示保持不变。
//!
//! # 文件格式
//!
//! ```text
//! [魔数: 4 bytes] "FVNK"
//! [版本: u32]
//! [时间: f64]
//! [时间步序号: u64]
//! [负载长度: u64]
//! [负载: bincode]
//! [CRC32: u32]
//! ```
//!
//! 所有定长字段为小端序。CRC32 覆盖 CRC 之前的全部字节。

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use fvn_foundation::{FvnError, FvnResult};

use crate::assembly::ElementEvaluator;
use crate::cache::CacheSnapshot;
use crate::model::FvModel;
use crate::newton::{NewtonControllerState, NewtonMethod};
use crate::timestep::TimeStepDriver;

// ============================================================
// 常量
// ============================================================

/// 检查点文件格式版本
const CHECKPOINT_VERSION: u32 = 1;

/// 检查点魔数
const CHECKPOINT_MAGIC: &[u8; 4] = b"FVNK";

/// 头部长度：魔数 + 版本 + 时间 + 序号 + 负载长度
const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8;

// ============================================================
// 检查点数据
// ============================================================

/// 检查点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<Q> {
    /// 模拟时间
    pub time: f64,
    /// 下一步将尝试的步长
    pub dt: f64,
    /// 已接受的时间步数
    pub step_index: usize,
    /// 控制器状态（恢复时只使用步数）
    pub controller: NewtonControllerState,
    /// 每个自由度的方程数
    pub num_eq: usize,
    /// 解的全部历史层
    pub solutions: Vec<Vec<f64>>,
    /// 中间量缓存
    pub cache: CacheSnapshot<Q>,
}

impl<Q> Checkpoint<Q>
where
    Q: Clone + Serialize + DeserializeOwned,
{
    /// 采集当前状态
    pub fn capture<E>(model: &FvModel<E>, driver: &TimeStepDriver, newton: &NewtonMethod) -> Self
    where
        E: ElementEvaluator<Quantities = Q>,
    {
        Self {
            time: driver.time(),
            dt: driver.dt(),
            step_index: driver.stats().accepted_steps,
            controller: newton.controller().state(),
            num_eq: model.num_eq(),
            solutions: model.solutions().iter().map(|s| s.as_slice().to_vec()).collect(),
            cache: model.engine().cache().snapshot(),
        }
    }

    /// 恢复到模型、驱动与牛顿法
    ///
    /// 模型的历史层数、方程数与自由度数必须与检查点一致。
    pub fn restore_into<E>(
        self,
        model: &mut FvModel<E>,
        driver: &mut TimeStepDriver,
        newton: &mut NewtonMethod,
    ) -> FvnResult<()>
    where
        E: ElementEvaluator<Quantities = Q>,
    {
        FvnError::check_size("checkpoint num_eq", model.num_eq(), self.num_eq)?;
        FvnError::check_size("checkpoint history", model.history_size(), self.solutions.len())?;
        for (slot, values) in self.solutions.iter().enumerate() {
            let target = model.solution_mut(slot)?;
            FvnError::check_size("checkpoint solution", target.len(), values.len())?;
            target.as_mut_slice().copy_from_slice(values);
        }
        model.engine_mut().cache_mut().restore(self.cache)?;
        driver.restore(self.time, self.dt);
        newton.controller_mut().restore_step_count(self.controller.step_count);
        Ok(())
    }

    /// 编码为字节
    pub fn to_bytes(&self) -> FvnResult<Vec<u8>> {
        let payload = bincode::serialize(self).map_err(|e| FvnError::serialization(e.to_string()))?;

        let mut data = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
        data.extend_from_slice(CHECKPOINT_MAGIC);
        data.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        data.extend_from_slice(&self.time.to_le_bytes());
        data.extend_from_slice(&(self.step_index as u64).to_le_bytes());
        data.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// 从字节解码
    pub fn from_bytes(bytes: &[u8]) -> FvnResult<Self> {
        if bytes.len() < HEADER_LEN + 4 {
            return Err(FvnError::checkpoint("数据太短"));
        }

        let crc_offset = bytes.len() - 4;
        let data = &bytes[..crc_offset];
        let stored_crc = u32::from_le_bytes(read_array(bytes, crc_offset)?);
        let computed_crc = compute_crc32(data);
        if stored_crc != computed_crc {
            return Err(FvnError::checkpoint(format!(
                "校验和错误: 期望 {stored_crc:08x}, 实际 {computed_crc:08x}"
            )));
        }

        if &data[..4] != CHECKPOINT_MAGIC {
            return Err(FvnError::checkpoint("无效的检查点格式"));
        }
        let version = u32::from_le_bytes(read_array(data, 4)?);
        if version != CHECKPOINT_VERSION {
            return Err(FvnError::checkpoint(format!(
                "版本不兼容: 文件版本 {version}, 当前版本 {CHECKPOINT_VERSION}"
            )));
        }
        let time = f64::from_le_bytes(read_array(data, 8)?);
        let step_index = u64::from_le_bytes(read_array(data, 16)?) as usize;
        let payload_len = u64::from_le_bytes(read_array(data, 24)?) as usize;
        if HEADER_LEN + payload_len != data.len() {
            return Err(FvnError::checkpoint(format!(
                "负载长度 {payload_len} 与文件大小不一致"
            )));
        }

        let checkpoint: Self = bincode::deserialize(&data[HEADER_LEN..])
            .map_err(|e| FvnError::serialization(e.to_string()))?;
        if checkpoint.time != time || checkpoint.step_index != step_index {
            return Err(FvnError::checkpoint("头部与负载不一致"));
        }
        Ok(checkpoint)
    }

    /// 保存到文件（先写临时文件再原子重命名）
    pub fn save(&self, path: &Path) -> FvnResult<()> {
        let data = self.to_bytes()?;
        let temp_path = path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&data)?;
            writer.flush()?;
        }
        std::fs::rename(&temp_path, path)?;
        log::info!("检查点已保存: {} (t={:.6e})", path.display(), self.time);
        Ok(())
    }

    /// 从文件加载
    pub fn load(path: &Path) -> FvnResult<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_bytes(&data)
    }
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> FvnResult<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| FvnError::checkpoint(format!("偏移 {offset} 处数据截断")))
}

// ============================================================
// CRC32
// ============================================================

/// CRC32 校验和（IEEE 多项式）
fn compute_crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = CRC32_TABLE[index] ^ (crc >> 8);
    }
    !crc
}

const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 { 0xEDB8_8320 ^ (crc >> 1) } else { crc >> 1 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC32 查找表（编译期生成）
const CRC32_TABLE: [u32; 256] = generate_crc32_table();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newton::NewtonPhase;

    fn sample() -> Checkpoint<f64> {
        Checkpoint {
            time: 0.25,
            dt: 0.01,
            step_index: 7,
            controller: NewtonControllerState {
                phase: NewtonPhase::Converged,
                step_count: 4,
                tolerance: 1e-8,
                target_steps: 6,
                max_steps: 12,
                current_physicality: 1.0,
                max_physicality: 1.0,
                probation_count: 0,
                one_by_magnitude: 1.0,
                defect: 1e-10,
            },
            num_eq: 1,
            solutions: vec![vec![1.0, 2.0, 3.0], vec![0.5, 1.5, 2.5]],
            cache: CacheSnapshot {
                history_size: 2,
                n_dofs: 3,
                slots: vec![
                    vec![(Some(1.0), true), (Some(2.0), false), (None, false)],
                    vec![(None, false); 3],
                ],
            },
        }
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let checkpoint = sample();
        let bytes = checkpoint.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"FVNK");

        let loaded = Checkpoint::<f64>::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.time, 0.25);
        assert_eq!(loaded.step_index, 7);
        assert_eq!(loaded.controller.step_count, 4);
        assert_eq!(loaded.solutions, checkpoint.solutions);
        assert_eq!(loaded.cache.slots[0][1], (Some(2.0), false));
    }

    #[test]
    fn test_detects_corruption() {
        let mut bytes = sample().to_bytes().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        let err = Checkpoint::<f64>::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("校验和"));
    }

    #[test]
    fn test_rejects_truncated_and_foreign_data() {
        let bytes = sample().to_bytes().unwrap();
        assert!(Checkpoint::<f64>::from_bytes(&bytes[..10]).is_err());

        let mut foreign = bytes.clone();
        foreign[..4].copy_from_slice(b"MHCK");
        let n = foreign.len() - 4;
        let crc = compute_crc32(&foreign[..n]);
        foreign[n..].copy_from_slice(&crc.to_le_bytes());
        let err = Checkpoint::<f64>::from_bytes(&foreign).unwrap_err();
        assert!(err.to_string().contains("格式"));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("fvn_ckpt_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.fvnk");

        sample().save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
        let loaded = Checkpoint::<f64>::load(&path).unwrap();
        assert_eq!(loaded.dt, 0.01);

        std::fs::remove_dir_all(&dir).ok();
    }
}
