//! Output formatting for CLI commands.

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

use crate::domain::models::{Agent, AgentStatus, Task, TaskStatus};

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&result.to_json()).unwrap_or_default()
        );
    } else {
        println!("{}", result.to_human());
    }
}

/// Truncate a string to a maximum length, appending "..." if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn base_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| Cell::new(n).add_attribute(Attribute::Bold))
        .collect()
}

fn task_status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Pending => Color::Yellow,
        TaskStatus::InProgress => Color::Cyan,
        TaskStatus::ReadyForQa => Color::Blue,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Blocked => Color::Magenta,
    }
}

fn agent_status_color(status: AgentStatus) -> Color {
    match status {
        AgentStatus::Idle => Color::Green,
        AgentStatus::Working => Color::Cyan,
        AgentStatus::Stuck => Color::Red,
    }
}

pub fn task_table(tasks: &[Task]) -> String {
    let mut table = base_table();
    table.set_header(header(&["ID", "Title", "Status", "Priority", "Retries", "Deps"]));
    for task in tasks {
        table.add_row(vec![
            Cell::new(&task.display_id),
            Cell::new(truncate(&task.title, 40)),
            Cell::new(task.status.as_str()).fg(task_status_color(task.status)),
            Cell::new(task.priority.as_str()),
            Cell::new(task.retry_count),
            Cell::new(task.depends_on.len()),
        ]);
    }
    table.to_string()
}

pub fn agent_table(agents: &[Agent]) -> String {
    let mut table = base_table();
    table.set_header(header(&["Name", "Role", "Status", "Task", "Heartbeat", "Done", "Failed"]));
    for agent in agents {
        let task = agent
            .current_task_id
            .map_or_else(|| "-".to_string(), |id| id.simple().to_string()[..8].to_string());
        table.add_row(vec![
            Cell::new(&agent.name),
            Cell::new(agent.role.as_str()),
            Cell::new(agent.status.as_str()).fg(agent_status_color(agent.status)),
            Cell::new(task),
            Cell::new(agent.heartbeat_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(agent.tasks_completed),
            Cell::new(agent.tasks_failed),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AgentRole;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer title here", 10), "a longe...");
    }

    #[test]
    fn test_task_table_contains_rows() {
        let task = Task::with_title("Write docs", "d");
        let rendered = task_table(std::slice::from_ref(&task));
        assert!(rendered.contains(&task.display_id));
        assert!(rendered.contains("pending"));
    }

    #[test]
    fn test_agent_table_shows_idle_agent_without_task() {
        let agent = Agent::new("worker-1", AgentRole::Worker);
        let rendered = agent_table(&[agent]);
        assert!(rendered.contains("worker-1"));
        assert!(rendered.contains("idle"));
    }
}
