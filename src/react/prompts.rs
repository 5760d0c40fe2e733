//! 提示词模板
//!
//! 模板中的 `{{name}}` 在渲染时替换为变量值，未知变量原样保留。
//! 默认模板内置；可从目录加载同名 .md 文件逐个覆盖。

use std::path::Path;

/// 规划阶段用到的六个模板
#[derive(Debug, Clone)]
pub struct PlanningPrompts {
    pub initial_facts: String,
    /// 变量：task, tools, managed_agents, answer_facts
    pub initial_plan: String,
    pub update_facts_pre_messages: String,
    pub update_facts_post_messages: String,
    /// 变量：task
    pub update_plan_pre_messages: String,
    /// 变量：task, tools, managed_agents, facts_update, remaining_steps
    pub update_plan_post_messages: String,
}

/// 作为子 Agent 被调用时的任务包装与报告模板（变量：name, task / name, final_answer）
#[derive(Debug, Clone)]
pub struct ManagedAgentPrompts {
    pub task: String,
    pub report: String,
}

/// provide_final_answer 使用的前后消息（post 变量：task）
#[derive(Debug, Clone)]
pub struct FinalAnswerPrompts {
    pub pre_messages: String,
    pub post_messages: String,
}

#[derive(Debug, Clone)]
pub struct AgentPrompts {
    /// 变量：tools, managed_agents, globals, description
    pub system_prompt: String,
    pub planning: PlanningPrompts,
    pub managed_agent: ManagedAgentPrompts,
    pub final_answer: FinalAnswerPrompts,
}

/// 替换 `{{ name }}` 占位符（花括号内允许空白）
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match vars.iter().find(|(k, _)| *k == key) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// 覆盖文件名与对应字段
const OVERRIDE_FILES: [&str; 11] = [
    "system_prompt",
    "initial_facts",
    "initial_plan",
    "update_facts_pre_messages",
    "update_facts_post_messages",
    "update_plan_pre_messages",
    "update_plan_post_messages",
    "managed_agent_task",
    "managed_agent_report",
    "final_answer_pre_messages",
    "final_answer_post_messages",
];

impl AgentPrompts {
    fn slot(&mut self, name: &str) -> Option<&mut String> {
        Some(match name {
            "system_prompt" => &mut self.system_prompt,
            "initial_facts" => &mut self.planning.initial_facts,
            "initial_plan" => &mut self.planning.initial_plan,
            "update_facts_pre_messages" => &mut self.planning.update_facts_pre_messages,
            "update_facts_post_messages" => &mut self.planning.update_facts_post_messages,
            "update_plan_pre_messages" => &mut self.planning.update_plan_pre_messages,
            "update_plan_post_messages" => &mut self.planning.update_plan_post_messages,
            "managed_agent_task" => &mut self.managed_agent.task,
            "managed_agent_report" => &mut self.managed_agent.report,
            "final_answer_pre_messages" => &mut self.final_answer.pre_messages,
            "final_answer_post_messages" => &mut self.final_answer.post_messages,
            _ => return None,
        })
    }

    /// 以默认模板为底，目录中存在的 `<name>.md` 覆盖对应模板
    pub fn load_from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut prompts = Self::default();
        for name in OVERRIDE_FILES {
            let path = dir.join(format!("{name}.md"));
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    if let Some(slot) = prompts.slot(name) {
                        *slot = text;
                        tracing::debug!(template = name, "prompt template overridden");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(prompts)
    }
}

impl Default for AgentPrompts {
    fn default() -> Self {
        Self {
            system_prompt: SYSTEM_PROMPT.trim().to_string(),
            planning: PlanningPrompts {
                initial_facts: INITIAL_FACTS.trim().to_string(),
                initial_plan: INITIAL_PLAN.trim().to_string(),
                update_facts_pre_messages: UPDATE_FACTS_PRE.trim().to_string(),
                update_facts_post_messages: UPDATE_FACTS_POST.trim().to_string(),
                update_plan_pre_messages: UPDATE_PLAN_PRE.trim().to_string(),
                update_plan_post_messages: UPDATE_PLAN_POST.trim().to_string(),
            },
            managed_agent: ManagedAgentPrompts {
                task: MANAGED_TASK.trim().to_string(),
                report: MANAGED_REPORT.trim().to_string(),
            },
            final_answer: FinalAnswerPrompts {
                pre_messages: FINAL_ANSWER_PRE.trim().to_string(),
                post_messages: FINAL_ANSWER_POST.trim().to_string(),
            },
        }
    }
}

const SYSTEM_PROMPT: &str = r#"
You are an expert javascript developer who can solve any task using only valid javascript code. You will be given a task to solve as best you can.

To solve the task, you must plan forward to proceed in a series of steps, in a cycle of 'Thought:', 'Code:', and 'Observation:' sequences.

At each step, in the 'Thought:' sequence, explain your reasoning towards solving the task and the capabilities that you want to use.
Then in the 'Code:' sequence, write the code in simple javascript. The code sequence must end with '```<end_code>'.
Every capability is an async function taking a single object argument, as described by its signature; always call it with await.
Use console.log() to print anything you need for the next step: printed output appears in the 'Observation:' field of the next step.
In the end you have to return a final answer using the `finalAnswer` capability.

Example:
Task: "What is the result of the following operation: 5 + 3 + 1294.678?"

Thought: I will compute the result in javascript and return it with `finalAnswer`.
Code:
```js
const result = 5 + 3 + 1294.678
await finalAnswer({ answer: String(result) })
```<end_code>

On top of performing computations in javascript, you only have access to these capabilities:
{{tools}}
{{managed_agents}}

Here are the rules you should always follow to solve your task:
1. Always provide a 'Thought:' sequence, and a 'Code:\n```js' sequence ending with '```<end_code>', else you will fail.
2. Use only variables that you have defined!
3. Always use the right arguments for the capabilities, as an object: 'await search({ query: "..." })'.
4. Take care to not chain too many sequential capability calls in the same code block when the output format is unpredictable: print results with console.log() and use them in the next block.
5. Call a capability only when needed, and never re-do a call that you previously did with the exact same arguments.
6. Don't name any new variable with the same name as a capability: for instance don't name a variable 'finalAnswer'.
7. Never create any notional variables in your code.
8. Imports are not available. Only the following global variables are available: [{{globals}}].
9. Top-level variables persist between code executions: a variable created in one step can be used in the next ones.
10. `terminate` must be the only capability called in its step.
11. Don't give up! You're in charge of solving the task, not providing directions to solve it.

{{description}}

Now Begin!
"#;

const INITIAL_FACTS: &str = r#"
Below I will present you a task.

You will now build a comprehensive preparatory survey of which facts we have at our disposal and which ones we still need.
To do so, you will have to read the task and identify things that must be discovered in order to successfully complete it.
Don't make any assumptions. For each item, provide a thorough reasoning. Here is how you will structure this survey:

---
### 1. Facts given in the task
List here the specific facts given in the task that could help you (there might be nothing here).

### 2. Facts to look up
List here any facts that we may need to look up.
Also list where to find each of these, for instance a website, a file... - maybe the task contains some sources that you should re-use here.

### 3. Facts to derive
List here anything that we want to derive from the above by logical reasoning, for instance computation or simulation.

Keep in mind that "facts" will typically be specific names, dates, values, etc. Your answer should use the below headings:
### 1. Facts given in the task
### 2. Facts to look up
### 3. Facts to derive
Do not add anything else.
"#;

const INITIAL_PLAN: &str = r#"
You are a world expert at making efficient plans to solve any task using a set of carefully crafted capabilities.

Now for the given task, develop a step-by-step high-level plan taking into account the above inputs and list of facts.
This plan should involve individual tasks based on the available capabilities, that if executed correctly will yield the correct answer.
Do not skip steps, do not add any superfluous steps. Only write the high-level plan, DO NOT DETAIL INDIVIDUAL CAPABILITY CALLS.
After writing the final step of the plan, write the '<end_plan>' tag and stop there.

Here is your task:

Task:
```
{{task}}
```
You can leverage these capabilities:
{{tools}}
{{managed_agents}}

List of facts that you know:
```
{{answer_facts}}
```

Now begin! Write your plan below.
"#;

const UPDATE_FACTS_PRE: &str = r#"
You are a world expert at gathering known and unknown facts based on a conversation.
Below you will find a task, and a history of attempts made to solve the task. You will have to produce a list of these:
### 1. Facts given in the task
### 2. Facts that we have learned
### 3. Facts still to look up
### 4. Facts still to derive
Find the task and history below:
"#;

const UPDATE_FACTS_POST: &str = r#"
Earlier we've built a list of facts.
But since in your previous steps you may have learned useful new facts or invalidated some false ones.
Please update your list of facts based on the previous history, and provide these headings:
### 1. Facts given in the task
### 2. Facts that we have learned
### 3. Facts still to look up
### 4. Facts still to derive

Now write your new list of facts below.
"#;

const UPDATE_PLAN_PRE: &str = r#"
You are a world expert at making efficient plans to solve any task using a set of carefully crafted capabilities.

You have been given a task:
```
{{task}}
```

Find below the record of what has been tried so far to solve it. Then you will be asked to make an updated plan to solve the task.
If the previous tries so far have met some success, you can make an updated plan based on these actions.
If you are stalled, you can make a completely new plan starting from scratch.
"#;

const UPDATE_PLAN_POST: &str = r#"
You're still working towards solving this task:
```
{{task}}
```

You can leverage these capabilities:
{{tools}}
{{managed_agents}}

Here is the up to date list of facts that you know:
```
{{facts_update}}
```

Now for the given task, develop a step-by-step high-level plan taking into account the above inputs and list of facts.
This plan should involve individual tasks based on the available capabilities, that if executed correctly will yield the correct answer.
Beware that you have {{remaining_steps}} steps remaining.
Do not skip steps, do not add any superfluous steps. Only write the high-level plan, DO NOT DETAIL INDIVIDUAL CAPABILITY CALLS.
After writing the final step of the plan, write the '<end_plan>' tag and stop there.

Now write your new plan below.
"#;

const MANAGED_TASK: &str = r#"
You're a helpful agent named '{{name}}'.
You have been submitted this task by your manager.
---
Task:
{{task}}
---
You're helping your manager solve a wider task: so make sure to not provide a one-line answer, but give as much information as possible to give them a clear understanding of the answer.

Your finalAnswer WILL HAVE to contain these parts:
### 1. Task outcome (short version):
### 2. Task outcome (extremely detailed version):
### 3. Additional context (if relevant):

Put all these in your finalAnswer call, everything that you do not pass as an argument to finalAnswer will be lost.
And even if your task resolution is not successful, please return as much context as possible, so that your manager can act upon this feedback.
"#;

const MANAGED_REPORT: &str = r#"
Here is the final answer from your managed agent '{{name}}':
{{final_answer}}
"#;

const FINAL_ANSWER_PRE: &str = r#"
An agent tried to answer a user query but it got stuck and failed to do so. You are tasked with providing an answer instead. Here is the agent's memory:
"#;

const FINAL_ANSWER_POST: &str = r#"
Based on the above, please provide an answer to the following user request:
{{task}}
"#;

/// 团队成员段落；没有子 Agent 时为空
pub fn managed_agents_section(agents_prompt: &str) -> String {
    if agents_prompt.is_empty() {
        return String::new();
    }
    format!(
        "\nYou can also give tasks to team members.\n\
         Calling a team member works the same as for calling a capability: the argument is an object with a 'task' field, a long string explaining your task.\n\
         Given that this team member is a real human, you should be very verbose in your task.\n\
         Here is a list of the team members that you can call:\n{agents_prompt}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let out = render("Hi {{ name }}, task: {{task}} {{unknown}}", &[("name", "bee"), ("task", "t")]);
        assert_eq!(out, "Hi bee, task: t {{unknown}}");
        assert_eq!(render("open {{ end", &[]), "open {{ end");
    }

    #[test]
    fn test_defaults_carry_placeholders() {
        let prompts = AgentPrompts::default();
        assert!(prompts.system_prompt.contains("{{tools}}"));
        assert!(prompts.planning.update_plan_post_messages.contains("{{remaining_steps}}"));
        assert!(prompts.managed_agent.report.contains("{{final_answer}}"));
    }

    #[test]
    fn test_load_from_dir_overrides_present_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system_prompt.md"), "custom {{tools}}").unwrap();
        std::fs::write(dir.path().join("unrelated.md"), "ignored").unwrap();
        let prompts = AgentPrompts::load_from_dir(dir.path()).unwrap();
        assert_eq!(prompts.system_prompt, "custom {{tools}}");
        assert_eq!(
            prompts.planning.initial_facts,
            AgentPrompts::default().planning.initial_facts
        );
    }

    #[test]
    fn test_managed_agents_section() {
        assert!(managed_agents_section("").is_empty());
        assert!(managed_agents_section("- helper: digs").contains("- helper: digs"));
    }
}
