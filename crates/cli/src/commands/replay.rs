use std::path::Path;
use std::process;
use std::time::Duration;

use waymark_engine::{DecideError, RebuildPolicy, RebuildReport};
use waymark_storage::LifecycleStorage;

use super::load_config;
use crate::runtime::Runtime;
use crate::{report_error, tokio_runtime, OutputFormat};

pub(crate) fn cmd_replay(
    config_path: &Path,
    entity_id: Option<&str>,
    all: bool,
    repair: bool,
    output: OutputFormat,
    quiet: bool,
) {
    let config = load_config(config_path, output, quiet);
    let policy = if repair {
        RebuildPolicy::Repair
    } else {
        RebuildPolicy::Verify
    };

    let rt = tokio_runtime(output, quiet);
    let results = rt.block_on(async {
        let runtime = Runtime::build(&config)?;
        let ids: Vec<String> = match entity_id.filter(|_| !all) {
            Some(id) => vec![id.to_string()],
            None => runtime
                .decider
                .storage()
                .list_snapshots(None, None)
                .await
                .map_err(|e| format!("could not list snapshots: {}", e))?
                .into_iter()
                .map(|s| s.entity_id)
                .collect(),
        };
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = runtime.decider.rebuild(&id, policy).await;
            results.push((id, result));
        }
        runtime.shutdown(Duration::ZERO).await;
        Ok::<_, String>(results)
    });
    let results = match results {
        Ok(r) => r,
        Err(e) => {
            report_error(&e, output, quiet);
            process::exit(1);
        }
    };

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    match output {
        OutputFormat::Json => {
            let values: Vec<serde_json::Value> =
                results.iter().map(|(id, r)| report_json(id, r)).collect();
            let json = serde_json::to_string_pretty(&values)
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
            println!("{}", json);
        }
        OutputFormat::Text => {
            if results.is_empty() && !quiet {
                println!("no entities to replay");
            }
            for (id, result) in &results {
                match result {
                    Ok(report) => {
                        if !quiet {
                            println!("{}", describe(report));
                        }
                    }
                    Err(e) => report_error(&format!("{}: {}", id, e), output, quiet),
                }
            }
        }
    }

    if failed > 0 {
        process::exit(1);
    }
}

fn describe(report: &RebuildReport) -> String {
    let outcome = if report.written {
        "snapshot rewritten"
    } else {
        "snapshot verified"
    };
    let halt = if report.was_halted { ", halt lifted" } else { "" };
    match &report.snapshot {
        Some(snap) => format!(
            "{}: replayed {} events -> {} v{} ({}{})",
            report.entity_id, report.events, snap.state, snap.version, outcome, halt
        ),
        None => format!("{}: no events", report.entity_id),
    }
}

pub(crate) fn report_json(entity_id: &str, result: &Result<RebuildReport, DecideError>) -> serde_json::Value {
    match result {
        Ok(report) => serde_json::json!({
            "entity_id": report.entity_id,
            "events": report.events,
            "written": report.written,
            "was_halted": report.was_halted,
            "snapshot": report.snapshot,
        }),
        Err(e) => serde_json::json!({
            "entity_id": entity_id,
            "error": e.kind(),
            "message": e.to_string(),
        }),
    }
}
