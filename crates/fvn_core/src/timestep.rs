// crates/fvn_core/src/timestep.rs

//! 时间推进驱动
//!
//! 每个时间步调用一次牛顿法：
//!
//! - 收敛：推进时间层（解与缓存历史后移），按控制器建议调整下一步长
//! - 不收敛：回退当前解与缓存第 0 层，按控制器建议缩小步长重试
//!
//! 步长始终限制在 `[dt_min, dt_max]` 内；建议步长低于 `dt_min`
//! 或重试次数用尽时返回错误。

use fvn_config::TimeSteppingConfig;
use fvn_foundation::{FvnError, FvnResult};

use crate::assembly::ElementEvaluator;
use crate::model::FvModel;
use crate::newton::{NewtonMethod, NewtonOutcome};

/// 时间终点判定的相对容差
const END_TIME_EPS: f64 = 1e-12;

/// 单个时间步的记录
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRecord {
    /// 时间步序号（从 1 开始）
    pub index: usize,
    /// 步末时间
    pub time: f64,
    /// 实际采用的步长
    pub dt: f64,
    /// 牛顿迭代步数
    pub newton_steps: usize,
    /// 本步重试次数
    pub retries: usize,
}

/// 时间推进统计
#[derive(Debug, Clone, Default)]
pub struct TimeStepStats {
    /// 接受的时间步数
    pub accepted_steps: usize,
    /// 被拒绝的尝试次数
    pub rejected_attempts: usize,
    /// 累计牛顿迭代步数
    pub newton_iterations: usize,
    /// 使用过的最小步长
    pub min_dt: Option<f64>,
    /// 使用过的最大步长
    pub max_dt: Option<f64>,
}

impl TimeStepStats {
    fn record_accepted(&mut self, dt: f64, newton_steps: usize) {
        self.accepted_steps += 1;
        self.newton_iterations += newton_steps;
        self.min_dt = Some(self.min_dt.map_or(dt, |m| m.min(dt)));
        self.max_dt = Some(self.max_dt.map_or(dt, |m| m.max(dt)));
    }

    /// 平均每步牛顿迭代数
    pub fn avg_newton_iterations(&self) -> f64 {
        if self.accepted_steps > 0 {
            self.newton_iterations as f64 / self.accepted_steps as f64
        } else {
            0.0
        }
    }
}

/// 时间推进驱动
#[derive(Debug, Clone)]
pub struct TimeStepDriver {
    config: TimeSteppingConfig,
    time: f64,
    dt: f64,
    stats: TimeStepStats,
}

impl TimeStepDriver {
    /// 创建驱动
    pub fn new(config: TimeSteppingConfig) -> FvnResult<Self> {
        if !(config.dt_min > 0.0) || config.dt_min > config.dt_max {
            return Err(FvnError::config(format!(
                "时间步长范围无效: [{}, {}]",
                config.dt_min, config.dt_max
            )));
        }
        if !(config.initial_dt > 0.0) || !(config.end_time > 0.0) {
            return Err(FvnError::config("初始步长与终止时间必须为正数"));
        }
        let dt = config.initial_dt.clamp(config.dt_min, config.dt_max);
        Ok(Self {
            config,
            time: 0.0,
            dt,
            stats: TimeStepStats::default(),
        })
    }

    /// 配置
    pub fn config(&self) -> &TimeSteppingConfig {
        &self.config
    }

    /// 当前时间
    pub fn time(&self) -> f64 {
        self.time
    }

    /// 下一步将尝试的步长
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// 统计
    pub fn stats(&self) -> &TimeStepStats {
        &self.stats
    }

    /// 是否已到达终止时间
    pub fn finished(&self) -> bool {
        self.time >= self.config.end_time * (1.0 - END_TIME_EPS)
    }

    /// 从检查点恢复时间与步长
    pub fn restore(&mut self, time: f64, dt: f64) {
        self.time = time;
        self.dt = self.clamp(dt);
    }

    /// 限制到 [dt_min, dt_max]
    pub fn clamp(&self, dt: f64) -> f64 {
        dt.clamp(self.config.dt_min, self.config.dt_max)
    }

    /// 推进一个时间步
    pub fn step<E: ElementEvaluator>(
        &mut self,
        model: &mut FvModel<E>,
        newton: &mut NewtonMethod,
    ) -> FvnResult<StepRecord> {
        let mut retries = 0;
        loop {
            let dt = self.dt.min(self.config.end_time - self.time);
            model.engine_mut().set_time(self.time + dt, dt);

            match newton.apply(model)? {
                NewtonOutcome::Converged { steps } => {
                    model.refresh_quantities()?;
                    model.advance_time_level()?;
                    self.time += dt;
                    let suggested = newton.controller().suggest_next_step_size(dt);
                    self.dt = self.clamp(suggested);
                    self.stats.record_accepted(dt, steps);

                    let record = StepRecord {
                        index: self.stats.accepted_steps,
                        time: self.time,
                        dt,
                        newton_steps: steps,
                        retries,
                    };
                    log::debug!(
                        "时间步 {} 完成: t={:.6e}, dt={:.3e}, 牛顿步数 {}, 下一步长 {:.3e}",
                        record.index,
                        record.time,
                        dt,
                        steps,
                        self.dt
                    );
                    return Ok(record);
                }
                NewtonOutcome::Failed(failure) => {
                    model.update_failed()?;
                    self.stats.rejected_attempts += 1;
                    retries += 1;

                    let suggested = newton.controller().suggest_next_step_size(dt);
                    log::warn!(
                        "Newton solver did not converge, reducing step size: t={:.6e}, dt={:.3e} -> {:.3e} ({})",
                        self.time,
                        dt,
                        suggested,
                        failure
                    );
                    if suggested < self.config.dt_min {
                        return Err(FvnError::TimeStepTooSmall {
                            dt: suggested,
                            dt_min: self.config.dt_min,
                        });
                    }
                    if retries > self.config.max_retries {
                        return Err(FvnError::RetriesExhausted {
                            time: self.time,
                            retries: self.config.max_retries,
                        });
                    }
                    self.dt = suggested.min(self.config.dt_max);
                }
            }
        }
    }

    /// 推进到终止时间，每步结束后调用 `on_step`
    pub fn run<E, F>(
        &mut self,
        model: &mut FvModel<E>,
        newton: &mut NewtonMethod,
        mut on_step: F,
    ) -> FvnResult<TimeStepStats>
    where
        E: ElementEvaluator,
        F: FnMut(&StepRecord, &FvModel<E>) -> FvnResult<()>,
    {
        while !self.finished() {
            let record = self.step(model, newton)?;
            on_step(&record, model)?;
        }
        log::info!(
            "时间推进完成: t={:.6e}, {} 步, 拒绝 {} 次, 平均牛顿步数 {:.2}",
            self.time,
            self.stats.accepted_steps,
            self.stats.rejected_attempts,
            self.stats.avg_newton_iterations()
        );
        Ok(self.stats.clone())
    }
}
