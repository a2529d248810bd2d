// crates/fvn_core/src/linear_algebra/mod.rs

//! 稀疏线性代数
//!
//! 块向量与块稀疏矩阵承载组装结果；线性求解器把块矩阵展开为标量 CSR，
//! 用 ILU(0)/Jacobi 预条件的 BiCGStab 求解牛顿修正量。

pub mod block_matrix;
pub mod block_vector;
pub mod csr;
pub mod preconditioner;
pub mod solver;
pub mod vector_ops;

pub use block_matrix::BlockSparseMatrix;
pub use block_vector::BlockVector;
pub use csr::{CsrMatrix, CsrPattern};
pub use preconditioner::{
    build_preconditioner, IdentityPreconditioner, Ilu0Preconditioner, JacobiPreconditioner, Preconditioner,
};
pub use solver::{BiCgStabSolver, LinearSolveReport, LinearSolver, SolverStatus};
