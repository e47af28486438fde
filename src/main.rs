//! parssh CLI - parallel SSH task runner
//!
//! Thin caller around the task engine: parse flags, stream per-host result
//! lines, print the summary, map the outcome to the exit contract
//! (0 all ok / 1 any host failed / 2 config error / 3 task timeout).

use clap::Parser;
use parssh::config::{CliArgs, RunConfig};
use parssh::error::Result;
use parssh::runner::{TaskEngine, TaskReport};
use parssh::task::HostResult;
use std::io::Write;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}

fn run(args: CliArgs) -> Result<i32> {
    let (config, spec) = RunConfig::from_cli(&args)?;
    let json = config.json;
    let detail_file = open_detail_file(&config)?;

    let mut engine = TaskEngine::new(config, spec);
    if !json || detail_file.is_some() {
        let stream_stdout = !json;
        engine = engine.with_observer(move |result| {
            if stream_stdout {
                print_result(result);
            }
            if let Some(file) = &detail_file {
                let line = render_line(result);
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{line}");
                }
            }
        });
    }

    let report = engine.execute()?;

    if report.listed_only {
        for host in &report.hosts {
            println!("{host}");
        }
        return Ok(0);
    }

    if json {
        print_json(&report)?;
    } else {
        print_summary(&report);
    }

    Ok(report.exit_code())
}

fn open_detail_file(config: &RunConfig) -> Result<Option<Mutex<std::fs::File>>> {
    match &config.output_file {
        None => Ok(None),
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| parssh::error::RunnerError::io(path, e))?;
            Ok(Some(Mutex::new(file)))
        }
    }
}

fn render_line(result: &HostResult) -> String {
    let status = if result.is_success() { "SUCCESS" } else { "FAILED" };
    format!("{} | {} | {}", result.host, status, result.message.trim_end())
}

fn print_result(result: &HostResult) {
    let status = if result.is_success() { "SUCCESS" } else { "FAILED" };
    println!("---- {} => {status}", result.host);
    let message = result.message.trim_end();
    if !message.is_empty() {
        println!("{message}");
    }
}

fn print_summary(report: &TaskReport) {
    let summary = report.summary();
    println!("\n=== Task Summary ===");
    println!("Task ID:  {}", summary.task_id);
    println!("Hosts:    {}", report.hosts.len());
    println!("Success:  {}", summary.success_count);
    println!("Failure:  {}", summary.failure_count);
    println!(
        "Elapsed:  {}",
        humantime::format_duration(std::time::Duration::from_secs(report.elapsed.as_secs()))
    );
    if report.timed_out {
        println!("Task timed out; remaining hosts were abandoned.");
    }
}

fn print_json(report: &TaskReport) -> Result<()> {
    let doc = serde_json::json!({
        "summary": report.summary(),
        "timed_out": report.timed_out,
        "hosts": report.hosts.len(),
        "results": report.results,
    });
    let rendered = serde_json::to_string_pretty(&doc)
        .map_err(|e| parssh::error::RunnerError::Unknown(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}
