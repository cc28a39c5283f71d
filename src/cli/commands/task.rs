//! Task CLI commands.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::sqlite::SqliteTaskRepository;
use crate::cli::commands::open_database;
use crate::cli::output::{output, task_table, CommandOutput};
use crate::domain::models::{Config, Task, TaskPriority, TaskStatus, TransitionSource};
use crate::domain::ports::{TaskFilter, TaskRepository, TransitionRecord};
use crate::services::event_bus::EventBus;
use crate::services::task_state_machine::{TaskStateMachine, TransitionContext};

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Add a pending task
    Add {
        /// Task title
        title: String,
        /// Detailed description / prompt
        #[arg(short, long, default_value = "")]
        description: String,
        /// Priority (low, normal, high, critical)
        #[arg(short, long, default_value = "normal")]
        priority: String,
        /// Task IDs that must complete first
        #[arg(long = "depends-on", value_delimiter = ',')]
        depends_on: Vec<Uuid>,
    },
    /// List tasks
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
        /// Maximum number of tasks
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Show a task and its transition history
    Show {
        /// Task UUID or display ID (T-xxxxxxxx)
        id: String,
    },
    /// Mark a running task as finished by its worker (in_progress -> ready_for_qa)
    Finish {
        /// Task UUID or display ID
        id: String,
    },
    /// Return a blocked task to the backlog (blocked -> pending)
    Unblock {
        /// Task UUID or display ID
        id: String,
    },
}

#[derive(Debug, Serialize)]
pub struct TaskListOutput {
    pub tasks: Vec<Task>,
    pub total: usize,
}

impl CommandOutput for TaskListOutput {
    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks found.".to_string();
        }
        format!("{}\nShowing {} task(s)", task_table(&self.tasks), self.total)
    }
}

#[derive(Debug, Serialize)]
pub struct TaskDetailOutput {
    pub task: Task,
    pub history: Vec<TransitionRecord>,
}

impl CommandOutput for TaskDetailOutput {
    fn to_human(&self) -> String {
        let t = &self.task;
        let mut lines = vec![
            format!("Task {} ({})", t.display_id, t.id),
            format!("  Title:    {}", t.title),
            format!("  Status:   {}", t.status),
            format!("  Priority: {}", t.priority.as_str()),
            format!("  Retries:  {}", t.retry_count),
        ];
        if !t.description.is_empty() {
            lines.push(format!("  Description: {}", t.description));
        }
        if let Some(agent) = t.assigned_agent_id {
            lines.push(format!("  Agent:    {agent}"));
        }
        if let Some(err) = &t.last_error {
            lines.push(format!("  Last error: {err}"));
        }
        if !t.depends_on.is_empty() {
            lines.push("  Depends on:".to_string());
            for dep in &t.depends_on {
                lines.push(format!("    - {dep}"));
            }
        }
        if !self.history.is_empty() {
            lines.push("  History:".to_string());
            for rec in &self.history {
                let err = rec
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default();
                lines.push(format!(
                    "    {} {} -> {} [{}]{}",
                    rec.created_at.format("%Y-%m-%d %H:%M:%S"),
                    rec.from_status,
                    rec.to_status,
                    rec.source,
                    err
                ));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TaskActionOutput {
    pub task_id: Uuid,
    pub display_id: String,
    pub status: TaskStatus,
    pub message: String,
}

impl CommandOutput for TaskActionOutput {
    fn to_human(&self) -> String {
        format!("{} ({}): {}", self.message, self.display_id, self.status)
    }
}

pub async fn execute(args: TaskArgs, config: &Config, json: bool) -> Result<()> {
    let pool = open_database(config).await?;
    let repo: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool));

    match args.command {
        TaskCommands::Add {
            title,
            description,
            priority,
            depends_on,
        } => handle_add(&repo, title, description, &priority, depends_on, json).await,
        TaskCommands::List { status, limit } => handle_list(&repo, status, limit, json).await,
        TaskCommands::Show { id } => handle_show(&repo, &id, json).await,
        TaskCommands::Finish { id } => {
            let task = resolve_task(&repo, &id).await?;
            let updated = transition(
                &repo,
                task.id,
                TaskStatus::ReadyForQa,
                TransitionContext::new(TransitionSource::Worker),
            )
            .await?;
            output(&action_output(&updated, "Task handed to QA"), json);
            Ok(())
        }
        TaskCommands::Unblock { id } => {
            let task = resolve_task(&repo, &id).await?;
            let updated = transition(
                &repo,
                task.id,
                TaskStatus::Pending,
                TransitionContext::new(TransitionSource::Operator),
            )
            .await?;
            output(&action_output(&updated, "Task unblocked"), json);
            Ok(())
        }
    }
}

async fn handle_add(
    repo: &Arc<dyn TaskRepository>,
    title: String,
    description: String,
    priority: &str,
    depends_on: Vec<Uuid>,
    json: bool,
) -> Result<()> {
    let priority = TaskPriority::from_str(priority)
        .ok_or_else(|| anyhow!("Invalid priority: {priority}. Use low, normal, high or critical"))?;

    let mut task = Task::with_title(title, description).with_priority(priority);
    for dep in depends_on {
        if repo.get(dep).await?.is_none() {
            bail!("Dependency {dep} does not exist");
        }
        task = task.with_dependency(dep);
    }
    task.validate().map_err(|e| anyhow!(e))?;

    repo.insert(&task).await.context("Failed to add task")?;
    output(&action_output(&task, "Task added"), json);
    Ok(())
}

async fn handle_list(
    repo: &Arc<dyn TaskRepository>,
    status: Option<String>,
    limit: i64,
    json: bool,
) -> Result<()> {
    let status = status
        .map(|s| TaskStatus::from_str(&s).ok_or_else(|| anyhow!("Invalid status: {s}")))
        .transpose()?;
    let tasks = repo
        .list(TaskFilter {
            status,
            limit: Some(limit),
            ..TaskFilter::default()
        })
        .await
        .context("Failed to list tasks")?;
    let total = tasks.len();
    output(&TaskListOutput { tasks, total }, json);
    Ok(())
}

async fn handle_show(repo: &Arc<dyn TaskRepository>, id: &str, json: bool) -> Result<()> {
    let task = resolve_task(repo, id).await?;
    let history = repo
        .transition_history(task.id)
        .await
        .context("Failed to load transition history")?;
    output(&TaskDetailOutput { task, history }, json);
    Ok(())
}

async fn transition(
    repo: &Arc<dyn TaskRepository>,
    task_id: Uuid,
    target: TaskStatus,
    ctx: TransitionContext,
) -> Result<Task> {
    // Nobody listens in this process. A running orchestrator finds the task
    // through its pending and ready-for-QA scanners.
    let machine = TaskStateMachine::new(Arc::clone(repo), Arc::new(EventBus::new()));
    machine
        .transition(task_id, target, ctx)
        .await
        .with_context(|| format!("Could not move task {task_id} to {target}"))
}

fn action_output(task: &Task, message: &str) -> TaskActionOutput {
    TaskActionOutput {
        task_id: task.id,
        display_id: task.display_id.clone(),
        status: task.status,
        message: message.to_string(),
    }
}

/// Accept a full UUID or a `T-xxxxxxxx` display ID.
pub async fn resolve_task(repo: &Arc<dyn TaskRepository>, id: &str) -> Result<Task> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return repo
            .get(uuid)
            .await?
            .ok_or_else(|| anyhow!("Task {id} not found. Use 'conductor task list' to see tasks."));
    }

    let wanted = id.to_uppercase();
    let mut matches: Vec<Task> = repo
        .list(TaskFilter::default())
        .await?
        .into_iter()
        .filter(|t| t.display_id.to_uppercase() == wanted)
        .collect();
    match matches.len() {
        0 => bail!("Task {id} not found. Use 'conductor task list' to see tasks."),
        1 => Ok(matches.remove(0)),
        n => bail!("Display ID {id} is ambiguous ({n} tasks); use the full UUID"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn repo() -> Arc<dyn TaskRepository> {
        let pool = create_migrated_test_pool().await.unwrap();
        Arc::new(SqliteTaskRepository::new(pool))
    }

    #[tokio::test]
    async fn test_resolve_by_uuid_and_display_id() {
        let repo = repo().await;
        let task = Task::with_title("Resolve me", "");
        repo.insert(&task).await.unwrap();

        let by_uuid = resolve_task(&repo, &task.id.to_string()).await.unwrap();
        assert_eq!(by_uuid.id, task.id);

        let lower = task.display_id.to_lowercase();
        let by_display = resolve_task(&repo, &lower).await.unwrap();
        assert_eq!(by_display.id, task.id);

        assert!(resolve_task(&repo, "T-00000000").await.is_err());
    }

    #[tokio::test]
    async fn test_add_rejects_unknown_dependency() {
        let repo = repo().await;
        let err = handle_add(
            &repo,
            "child".to_string(),
            String::new(),
            "normal",
            vec![Uuid::new_v4()],
            true,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_unblock_requires_blocked_status() {
        let repo = repo().await;
        let task = Task::with_title("pending already", "");
        repo.insert(&task).await.unwrap();

        let result = transition(
            &repo,
            task.id,
            TaskStatus::Pending,
            TransitionContext::new(TransitionSource::Operator),
        )
        .await;
        assert!(result.is_err());
    }
}
