use std::path::Path;
use std::process;

use waymark_mirror::reconcile;

use super::load_config;
use crate::runtime::ledger_client;
use crate::{report_error, tokio_runtime, OutputFormat};

/// Resubmit every dead-lettered envelope once. Exits 1 while any remain.
pub(crate) fn cmd_reconcile(
    config_path: &Path,
    dead_letter: Option<&Path>,
    output: OutputFormat,
    quiet: bool,
) {
    let config = load_config(config_path, output, quiet);
    let Some(settings) = config.mirror.as_ref() else {
        report_error(
            &format!("no [mirror] section in '{}'", config_path.display()),
            output,
            quiet,
        );
        process::exit(1);
    };
    let Some(path) = dead_letter.or(settings.dead_letter.as_deref()) else {
        report_error(
            "no dead-letter file: pass --dead-letter or set mirror.dead_letter",
            output,
            quiet,
        );
        process::exit(1);
    };

    let client = ledger_client(settings);
    let rt = tokio_runtime(output, quiet);
    let report = match rt.block_on(reconcile(path, client.as_ref())) {
        Ok(r) => r,
        Err(e) => {
            report_error(
                &format!("reconcile of '{}' failed: {}", path.display(), e),
                output,
                quiet,
            );
            process::exit(1);
        }
    };

    match output {
        OutputFormat::Json => {
            let resubmitted: Vec<serde_json::Value> = report
                .resubmitted
                .iter()
                .map(|(key, tx)| serde_json::json!({ "natural_key": key, "transaction_id": tx }))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "resubmitted": resubmitted,
                    "remaining": report.remaining,
                })
            );
        }
        OutputFormat::Text => {
            if !quiet {
                for (key, tx) in &report.resubmitted {
                    println!("resubmitted {} as {}", key, tx);
                }
                println!(
                    "{} resubmitted, {} remaining",
                    report.resubmitted.len(),
                    report.remaining.len()
                );
            }
        }
    }

    if !report.remaining.is_empty() {
        process::exit(1);
    }
}
