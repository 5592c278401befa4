//! `Corral` Daemon
//!
//! Runs one or more shell commands under the execution registry, captures
//! their NDJSON output, and optionally extracts structured JSON from each
//! execution's final result.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};

use corral_core::config::{Config, load_config, load_config_file};
use corral_core::extract_and_validate;
use corral_core::tracing_init::init_tracing;
use corral_daemon::subprocess::{
    CommandSpec, ExecutionParams, ExecutionRecord, ExecutionRegistry, ExecutionStatus,
};

#[derive(Parser, Debug)]
#[command(name = "corral-daemon")]
#[command(version, about = "Corral daemon - supervised subprocess runner")]
struct Args {
    /// Shell command to run (repeatable)
    #[arg(long = "cmd", required = true)]
    commands: Vec<String>,

    /// Settings file (skips global and project settings lookup)
    #[arg(long, env = "CORRAL_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum concurrently running executions
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Per-execution timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Log level for corral crates (overridden by `RUST_LOG`)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit structured JSON logs
    #[arg(long, env = "CORRAL_LOG_JSON")]
    log_json: bool,

    /// Working directory for every command
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Extract JSON from each final result
    #[arg(long)]
    extract: bool,

    /// Keys the extracted JSON must contain (comma separated, implies --extract)
    #[arg(long, value_delimiter = ',')]
    extract_fields: Vec<String>,
}

impl Args {
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config_file(path)?,
            None => load_config(Some(self.working_dir.as_path()))?,
        };

        if let Some(n) = self.max_concurrent {
            config.registry.max_concurrent = n;
        }
        if let Some(secs) = self.timeout {
            config.registry.timeout_secs = Some(secs);
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        config.validate()?;
        Ok(config)
    }

    fn wants_extraction(&self) -> bool {
        self.extract || !self.extract_fields.is_empty()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.resolve_config()?;

    init_tracing(
        &format!("corral_daemon={0},corral_core={0}", config.log_level),
        args.log_json,
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_concurrent = config.registry.max_concurrent,
        timeout_secs = ?config.registry.timeout_secs,
        commands = args.commands.len(),
        "Starting corral-daemon"
    );

    let registry = ExecutionRegistry::new(&config.registry, &config.stream)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweep_handle = (config.registry.sweep_interval_secs > 0).then(|| {
        registry.spawn_retention_sweep(
            Duration::from_secs(config.registry.sweep_interval_secs),
            shutdown_rx,
        )
    });

    let mut session_ids = Vec::with_capacity(args.commands.len());
    for command in &args.commands {
        let params = ExecutionParams::new(&args.working_dir, CommandSpec::shell(command))
            .with_query(command.clone());
        match registry.start_execution(params).await {
            Ok(session_id) => session_ids.push(session_id),
            Err(e) => error!(command = %command, error = %e, "Failed to start execution"),
        }
    }

    let wait_all = async {
        let mut records = Vec::with_capacity(session_ids.len());
        for session_id in &session_ids {
            if let Some(record) = registry.wait_for_completion(session_id).await {
                records.push(record);
            }
        }
        records
    };

    let records = tokio::select! {
        records = wait_all => records,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, killing executions");
            registry.kill_all().await;
            let mut records = Vec::with_capacity(session_ids.len());
            for session_id in &session_ids {
                if let Some(record) = registry.get_execution(session_id).await {
                    records.push(record);
                }
            }
            records
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweep_handle {
        let _ = handle.await;
    }

    let required: Vec<&str> = args.extract_fields.iter().map(String::as_str).collect();
    let mut unsuccessful = args.commands.len().saturating_sub(records.len());
    for record in &records {
        log_record(record);
        if args.wants_extraction() {
            report_extraction(record, &required)?;
        }
        if record.status != ExecutionStatus::Completed {
            unsuccessful += 1;
        }
    }

    info!("Daemon stopped");
    if unsuccessful > 0 {
        anyhow::bail!(
            "{unsuccessful} of {} executions did not complete successfully",
            args.commands.len()
        );
    }
    Ok(())
}

fn log_record(record: &ExecutionRecord) {
    for event in &record.events {
        debug!(
            session_id = %record.session_id,
            event_type = event.event_type(),
            "Captured event"
        );
    }

    let duration_ms = record
        .duration()
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    if record.status == ExecutionStatus::Completed {
        info!(
            session_id = %record.session_id,
            reported_session_id = ?record.reported_session_id,
            events = record.events.len(),
            ?duration_ms,
            "Execution completed"
        );
    } else {
        warn!(
            session_id = %record.session_id,
            status = %record.status,
            exit_code = ?record.exit_code,
            error = ?record.error,
            events = record.events.len(),
            "Execution did not complete"
        );
    }
}

/// Print one JSON line per execution with the extraction outcome.
#[allow(clippy::print_stdout)]
fn report_extraction(record: &ExecutionRecord, required: &[&str]) -> anyhow::Result<()> {
    let (data, error) = match record.final_result() {
        Some(text) => {
            let result = extract_and_validate(text, required);
            if !result.success {
                warn!(
                    session_id = %record.session_id,
                    error = ?result.error,
                    "JSON extraction failed"
                );
            }
            (result.data, result.error)
        }
        None => (None, Some("Execution produced no result event".to_string())),
    };

    let line = serde_json::json!({
        "session_id": record.session_id,
        "status": record.status,
        "exit_code": record.exit_code,
        "data": data,
        "error": error,
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}
