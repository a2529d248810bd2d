// crates/fvn_foundation/src/lib.rs

//! FvNewton Foundation Layer
//!
//! 基础层，提供整个工作空间共享的错误类型与校验宏。
//!
//! # 模块概览
//!
//! - [`error`]: 统一错误类型 [`FvnError`] 与 [`FvnResult`]
//!
//! # 错误分级
//!
//! 非线性求解中的"不收敛"和"线性求解失败"属于可恢复事件，
//! 由 `fvn_core` 以结果枚举上报，不经过本层错误类型。
//! 本层只描述致命错误：缓存误用、分区不一致、配置错误等。
//!
//! # 示例
//!
//! ```
//! use fvn_foundation::{ensure, FvnError, FvnResult};
//!
//! fn check_slot(slot: usize, history: usize) -> FvnResult<()> {
//!     ensure!(slot < history, FvnError::cache_misuse(format!("slot {slot} >= {history}")));
//!     Ok(())
//! }
//!
//! assert!(check_slot(0, 2).is_ok());
//! assert!(check_slot(2, 2).is_err());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;

pub use error::{FvnError, FvnResult};

/// 条件不满足时提前返回错误
///
/// `ensure!(cond, err)` 等价于 `if !cond { return Err(err.into()); }`
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return Err(::core::convert::From::from($err));
        }
    };
}

/// 从 `Option` 中取值，为 `None` 时提前返回错误
#[macro_export]
macro_rules! require {
    ($opt:expr, $err:expr $(,)?) => {
        match $opt {
            Some(value) => value,
            None => return Err(::core::convert::From::from($err)),
        }
    };
}

/// Prelude 模块，包含常用类型
pub mod prelude {
    pub use crate::error::{FvnError, FvnResult};
    pub use crate::{ensure, require};
}
