use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use std::time::Duration;
use task_queue_client::TaskQueueAsyncClient;
use task_queue_core::{Metadata, TaskRecord, TaskStatus};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tq-admin")]
#[command(about = "Task Queue Admin CLI", long_about = None)]
struct Args {
    /// Broker address
    #[arg(short, long, env = "TQ_ADDR", default_value = "127.0.0.1:50051")]
    addr: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a new task
    Enqueue {
        /// Task type
        #[arg(short, long)]
        task_type: String,

        /// Inline payload
        #[arg(short, long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// Read the payload from a file
        #[arg(long)]
        payload_file: Option<String>,

        /// Metadata entry, repeatable (key=value)
        #[arg(short, long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
    },

    /// Lease the oldest pending task
    Dequeue {
        /// Worker identity recorded on the lease
        #[arg(short, long)]
        worker_id: String,
    },

    /// Acknowledge a task
    Ack {
        /// Task ID
        task_id: String,

        /// Mark the task as failed instead of completed
        #[arg(long)]
        failed: bool,

        /// Result text stored on the task
        #[arg(short, long)]
        result: Option<String>,
    },

    /// Refresh the lease on an in-progress task
    Heartbeat {
        /// Task ID
        task_id: String,
    },

    /// List tasks
    List {
        /// Filter by status (PENDING, IN_PROGRESS, COMPLETED, FAILED)
        #[arg(short, long)]
        status: Option<String>,
    },
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn parse_metadata(entries: &[String]) -> anyhow::Result<Metadata> {
    let mut metadata = Metadata::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("Invalid metadata entry '{}', expected KEY=VALUE", entry);
        };
        if key.is_empty() {
            bail!("Invalid metadata entry '{}', key is empty", entry);
        }
        metadata.insert(key.to_string(), value.to_string());
    }
    Ok(metadata)
}

fn parse_status(status: Option<&str>) -> anyhow::Result<Option<TaskStatus>> {
    match status {
        None => Ok(None),
        Some(s) => Ok(Some(s.to_ascii_uppercase().parse::<TaskStatus>()?)),
    }
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn task_table(task: &TaskRecord) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["ID", task.id.as_str()]);
    table.add_row(vec!["Type", task.task_type.as_str()]);
    table.add_row(vec!["Status", task.status.as_str()]);
    table.add_row(vec!["Attempts", &task.attempts.to_string()]);
    table.add_row(vec!["Created", &format_millis(task.created_at)]);
    table.add_row(vec!["Updated", &format_millis(task.updated_at)]);
    if let Some(worker) = &task.worker_id {
        table.add_row(vec!["Worker", worker]);
    }
    if let Some(result) = &task.result {
        table.add_row(vec!["Result", result]);
    }
    for (key, value) in &task.metadata {
        table.add_row(vec![format!("meta.{}", key), value.clone()]);
    }
    table.add_row(vec!["Payload", task.payload.as_str()]);
    table
}

fn list_table(tasks: &[TaskRecord]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Type", "Status", "Attempts", "Worker", "Created"]);
    for task in tasks {
        table.add_row(vec![
            task.id.clone(),
            task.task_type.clone(),
            task.status.to_string(),
            task.attempts.to_string(),
            task.worker_id.clone().unwrap_or_default(),
            format_millis(task.created_at),
        ]);
    }
    table
}

fn print_task(format: Format, task: &TaskRecord) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(task)?),
        Format::Yaml => print!("{}", serde_yaml::to_string(task)?),
        Format::Table => println!("{}", task_table(task)),
    }
    Ok(())
}

fn print_tasks(format: Format, tasks: &[TaskRecord]) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(tasks)?),
        Format::Yaml => print!("{}", serde_yaml::to_string(tasks)?),
        Format::Table => println!("{}", list_table(tasks)),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let client = TaskQueueAsyncClient::connect(args.addr.clone())
        .await
        .with_context(|| format!("Failed to reach broker at {}", args.addr))?
        .with_timeout(Duration::from_secs(args.timeout));
    debug!("Connected to broker at {}", client.broker_address());

    match args.command {
        Commands::Enqueue {
            task_type,
            payload,
            payload_file,
            meta,
        } => {
            let payload = match (payload, payload_file) {
                (Some(inline), _) => inline,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read payload file {}", path))?,
                (None, None) => String::new(),
            };
            let metadata = parse_metadata(&meta)?;

            let task = client.enqueue(&task_type, &payload, metadata).await?;
            print_task(args.format, &task)?;
        }

        Commands::Dequeue { worker_id } => match client.dequeue(&worker_id).await? {
            Some(task) => print_task(args.format, &task)?,
            None => match args.format {
                Format::Json => println!("null"),
                Format::Yaml => println!("~"),
                Format::Table => eprintln!("No pending tasks"),
            },
        },

        Commands::Ack {
            task_id,
            failed,
            result,
        } => {
            let task = client.ack(&task_id, !failed, result).await?;
            print_task(args.format, &task)?;
        }

        Commands::Heartbeat { task_id } => {
            let task = client.heartbeat(&task_id).await?;
            print_task(args.format, &task)?;
        }

        Commands::List { status } => {
            let status = parse_status(status.as_deref())?;
            let tasks = client.list_tasks(status).await?;
            print_tasks(args.format, &tasks)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata() {
        let entries = vec!["agent=orion".to_string(), "note=a=b".to_string()];
        let metadata = parse_metadata(&entries).unwrap();
        assert_eq!(metadata.get("agent").map(String::as_str), Some("orion"));
        assert_eq!(metadata.get("note").map(String::as_str), Some("a=b"));

        assert!(parse_metadata(&["novalue".to_string()]).is_err());
        assert!(parse_metadata(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_parse_status_is_case_insensitive() {
        assert_eq!(parse_status(None).unwrap(), None);
        assert_eq!(
            parse_status(Some("in_progress")).unwrap(),
            Some(TaskStatus::InProgress)
        );
        assert!(parse_status(Some("done")).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "tq-admin", "--format", "json", "ack", "abc", "--failed", "--result", "boom",
        ])
        .unwrap();
        assert_eq!(args.format, Format::Json);
        match args.command {
            Commands::Ack {
                task_id,
                failed,
                result,
            } => {
                assert_eq!(task_id, "abc");
                assert!(failed);
                assert_eq!(result.as_deref(), Some("boom"));
            }
            other => panic!("Unexpected command {:?}", other),
        }

        assert!(Args::try_parse_from([
            "tq-admin", "enqueue", "-t", "demo", "-p", "x", "--payload-file", "f"
        ])
        .is_err());
    }

    #[test]
    fn test_task_table_lists_fields() {
        let mut metadata = Metadata::new();
        metadata.insert("agent".to_string(), "orion".to_string());
        let task = TaskRecord::new("demo", "payload", metadata).unwrap();

        let rendered = task_table(&task).to_string();
        assert!(rendered.contains(&task.id));
        assert!(rendered.contains("PENDING"));
        assert!(rendered.contains("meta.agent"));
    }

    #[test]
    fn test_structured_output_keeps_wire_names() {
        let task = TaskRecord::new("demo", "payload", Metadata::new()).unwrap();

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["type"], "demo");

        let yaml = serde_yaml::to_string(&task).unwrap();
        assert!(yaml.contains("status: PENDING"));
    }
}
