// crates/fvn_foundation/src/error.rs

//! 错误处理模块，定义统一错误类型
//!
//! 提供 `FvnError` 枚举和 `FvnResult` 类型别名。
//!
//! # 设计原则
//!
//! 1. **只含致命错误**: 可恢复的牛顿迭代失败不走错误通道
//! 2. **易用性**: 提供便捷的构造方法
//! 3. **可追溯**: 支持错误链

use thiserror::Error;

/// 统一结果类型
pub type FvnResult<T> = Result<T, FvnError>;

/// FvNewton 错误类型
#[derive(Error, Debug)]
pub enum FvnError {
    /// IO 错误
    #[error("IO错误: {message}")]
    Io {
        /// 描述性错误信息
        message: String,
        #[source]
        /// 可选的底层 IO 错误
        source: Option<std::io::Error>,
    },

    /// 缓存误用（DOF 数/时间层不一致、越界访问）
    #[error("中间量缓存误用: {message}")]
    CacheMisuse {
        /// 具体错误信息
        message: String,
    },

    /// 分区/通信不一致
    #[error("分区不一致: {message}")]
    PartitionMismatch {
        /// 具体错误信息
        message: String,
    },

    /// 数组大小不匹配
    #[error("数组大小不匹配: {name} 期望{expected}, 实际{actual}")]
    SizeMismatch {
        /// 数据名称
        name: &'static str,
        /// 期望大小
        expected: usize,
        /// 实际大小
        actual: usize,
    },

    /// 索引越界
    #[error("索引越界: {index_type} 索引 {index} 超出范围 0..{len}")]
    IndexOutOfBounds {
        /// 索引类别描述
        index_type: &'static str,
        /// 访问的索引
        index: usize,
        /// 上界（长度）
        len: usize,
    },

    /// 稀疏模式中不存在的矩阵块
    #[error("稀疏模式中不存在块 ({row}, {col})")]
    MissingMatrixEntry {
        /// 行 DOF
        row: usize,
        /// 列 DOF
        col: usize,
    },

    /// 单元求值失败（物理层返回）
    #[error("单元 {element} 求值失败: {message}")]
    Evaluation {
        /// 单元索引
        element: usize,
        /// 具体错误信息
        message: String,
    },

    /// 配置错误
    #[error("配置错误: {message}")]
    Config {
        /// 具体错误信息
        message: String,
    },

    /// 序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        /// 序列化失败原因
        message: String,
    },

    /// 检查点数据损坏或不兼容
    #[error("检查点错误: {message}")]
    Checkpoint {
        /// 具体错误信息
        message: String,
    },

    /// 时间步长低于下限，无法继续
    #[error("时间步长 {dt:.3e} 低于下限 {dt_min:.3e}")]
    TimeStepTooSmall {
        /// 建议的时间步长
        dt: f64,
        /// 允许的最小时间步长
        dt_min: f64,
    },

    /// 同一时间步重试次数用尽
    #[error("t={time:.6e} 处重试 {retries} 次仍未收敛")]
    RetriesExhausted {
        /// 时间步起点
        time: f64,
        /// 已重试次数
        retries: usize,
    },

    /// 内部错误
    #[error("内部错误: {message}")]
    Internal {
        /// 内部错误描述
        message: String,
    },

    /// 功能未实现
    #[error("功能未实现: {feature}")]
    NotImplemented {
        /// 未实现的功能描述
        feature: String,
    },
}

// ========================================================================
// 便捷构造方法
// ========================================================================

impl FvnError {
    /// 缓存误用
    pub fn cache_misuse(message: impl Into<String>) -> Self {
        Self::CacheMisuse {
            message: message.into(),
        }
    }

    /// 分区不一致
    pub fn partition_mismatch(message: impl Into<String>) -> Self {
        Self::PartitionMismatch {
            message: message.into(),
        }
    }

    /// 数组大小不匹配
    pub fn size_mismatch(name: &'static str, expected: usize, actual: usize) -> Self {
        Self::SizeMismatch {
            name,
            expected,
            actual,
        }
    }

    /// 索引越界
    pub fn index_out_of_bounds(index_type: &'static str, index: usize, len: usize) -> Self {
        Self::IndexOutOfBounds {
            index_type,
            index,
            len,
        }
    }

    /// 单元求值失败
    pub fn evaluation(element: usize, message: impl Into<String>) -> Self {
        Self::Evaluation {
            element,
            message: message.into(),
        }
    }

    /// 配置错误
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// 序列化错误
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// 检查点错误
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    /// 内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// 功能未实现
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// 是否为缓存误用
    pub fn is_cache_misuse(&self) -> bool {
        matches!(self, Self::CacheMisuse { .. })
    }
}

// ========================================================================
// 验证辅助方法
// ========================================================================

impl FvnError {
    /// 检查数组大小是否匹配
    #[inline]
    pub fn check_size(name: &'static str, expected: usize, actual: usize) -> FvnResult<()> {
        if expected != actual {
            Err(Self::size_mismatch(name, expected, actual))
        } else {
            Ok(())
        }
    }

    /// 检查索引是否在范围内
    #[inline]
    pub fn check_index(index_type: &'static str, index: usize, len: usize) -> FvnResult<()> {
        if index >= len {
            Err(Self::index_out_of_bounds(index_type, index, len))
        } else {
            Ok(())
        }
    }
}

impl From<std::io::Error> for FvnError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ensure, require};

    #[test]
    fn test_error_display() {
        let err = FvnError::cache_misuse("slot 3 超出历史长度 2");
        assert!(err.to_string().contains("缓存误用"));
        assert!(err.is_cache_misuse());
    }

    #[test]
    fn test_index_out_of_bounds() {
        let err = FvnError::index_out_of_bounds("Dof", 10, 5);
        let msg = err.to_string();
        assert!(msg.contains("Dof"));
        assert!(msg.contains("10"));
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_check_size() {
        assert!(FvnError::check_size("residual", 10, 10).is_ok());
        assert!(FvnError::check_size("residual", 10, 5).is_err());
    }

    #[test]
    fn test_check_index() {
        assert!(FvnError::check_index("Element", 5, 10).is_ok());
        assert!(FvnError::check_index("Element", 10, 10).is_err());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: FvnError = io_err.into();
        assert!(matches!(err, FvnError::Io { .. }));
    }

    #[test]
    fn test_ensure_macro() {
        fn check(value: i32) -> FvnResult<()> {
            ensure!(value > 0, FvnError::config("value must be positive"));
            Ok(())
        }

        assert!(check(1).is_ok());
        assert!(check(-1).is_err());
    }

    #[test]
    fn test_require_macro() {
        fn get_value(opt: Option<i32>) -> FvnResult<i32> {
            let v = require!(opt, FvnError::internal("missing"));
            Ok(v)
        }

        assert_eq!(get_value(Some(42)).unwrap(), 42);
        assert!(get_value(None).is_err());
    }
}
