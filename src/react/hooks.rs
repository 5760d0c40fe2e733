//! 步骤钩子：每个 ActionStep 之前与之后调用
//!
//! 钩子返回的错误是致命的，会中止 run（RunError::Hook）。

use async_trait::async_trait;

use crate::memory::AgentMemory;

#[async_trait]
pub trait StepHook: Send + Sync {
    fn name(&self) -> &str;

    /// 新步骤已追加到 memory、尚未调用模型
    async fn before_step(&self, _memory: &mut AgentMemory, _step_number: usize) -> Result<(), String> {
        Ok(())
    }

    /// 步骤执行完毕（无论成功或可恢复失败）
    async fn after_step(&self, _memory: &mut AgentMemory, _step_number: usize) -> Result<(), String> {
        Ok(())
    }
}

/// 只保留最近 keep_last 步的截图
pub struct ImagePruningHook {
    keep_last: usize,
}

impl ImagePruningHook {
    pub fn new(keep_last: usize) -> Self {
        Self { keep_last }
    }
}

#[async_trait]
impl StepHook for ImagePruningHook {
    fn name(&self) -> &str {
        "image_pruning"
    }

    async fn before_step(&self, memory: &mut AgentMemory, step_number: usize) -> Result<(), String> {
        memory.prune_images(step_number, self.keep_last);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ActionStep, MemoryStep};

    #[tokio::test]
    async fn test_image_pruning_hook() {
        let mut memory = AgentMemory::new("sys");
        for n in 1..=3 {
            let mut step = ActionStep::new(n);
            step.observations_images = vec!["img".into()];
            memory.push(MemoryStep::Action(step));
        }
        let hook = ImagePruningHook::new(1);
        hook.before_step(&mut memory, 3).await.unwrap();
        let counts: Vec<usize> = memory
            .action_steps()
            .map(|s| s.observations_images.len())
            .collect();
        assert_eq!(counts, vec![0, 0, 1]);
        hook.after_step(&mut memory, 3).await.unwrap();
    }
}
