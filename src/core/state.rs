//! 运行状态：步号、规划标志与阶段
//!
//! 只由主循环修改，每次 run() 开始时重置。

use serde::Serialize;

/// 一次 run 的阶段：Init → {Planning ⇄ Acting} → {Done | MaxStepsReached | CircuitBroken}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Planning,
    Acting,
    Done,
    MaxStepsReached,
    CircuitBroken,
}

/// 主循环持有的可变状态
#[derive(Clone, Debug, Serialize)]
pub struct RunState {
    pub step_number: usize,
    pub should_run_planning: bool,
    pub max_steps: usize,
    pub planning_interval: Option<usize>,
    /// 每次 run 开始时 should_run_planning 的初值
    pub initial_planning: bool,
    pub phase: RunPhase,
}

impl RunState {
    pub fn new(max_steps: usize, planning_interval: Option<usize>) -> Self {
        Self {
            step_number: 1,
            should_run_planning: false,
            max_steps,
            planning_interval,
            initial_planning: false,
            phase: RunPhase::Init,
        }
    }

    /// 新一轮 run：步号回到 1；只有显式开启 initial_planning 时才在第一步之前规划
    pub fn reset(&mut self) {
        self.step_number = 1;
        self.should_run_planning = self.initial_planning;
        self.phase = RunPhase::Init;
    }

    /// 刚完成的步骤 completed_step 满足 completed_step % interval == 1 时，下一轮先规划。
    /// interval 为 1 时每步之后都规划（取模恒为 0，按扩展处理）；0 视为未配置。
    pub fn update_planning(&mut self, completed_step: usize) {
        match self.planning_interval {
            Some(0) | None => {}
            Some(1) => self.should_run_planning = true,
            Some(interval) => {
                if completed_step % interval == 1 {
                    self.should_run_planning = true;
                }
            }
        }
    }

    pub fn remaining_steps(&self) -> usize {
        self.max_steps.saturating_sub(self.step_number)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.step_number > self.max_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_does_not_plan_unless_asked() {
        let mut state = RunState::new(10, Some(3));
        state.step_number = 7;
        state.reset();
        assert_eq!(state.step_number, 1);
        assert!(!state.should_run_planning);

        state.initial_planning = true;
        state.reset();
        assert!(state.should_run_planning);
    }

    #[test]
    fn test_planning_follows_completed_step() {
        let mut state = RunState::new(10, Some(3));
        let mut planned_before = Vec::new();
        for completed in 1..=7 {
            state.should_run_planning = false;
            state.update_planning(completed);
            if state.should_run_planning {
                planned_before.push(completed + 1);
            }
        }
        assert_eq!(planned_before, vec![2, 5, 8]);
    }

    #[test]
    fn test_interval_one_plans_every_step() {
        let mut state = RunState::new(5, Some(1));
        state.update_planning(2);
        assert!(state.should_run_planning);
    }

    #[test]
    fn test_zero_interval_never_plans() {
        let mut state = RunState::new(5, Some(0));
        state.update_planning(1);
        assert!(!state.should_run_planning);
    }
}
