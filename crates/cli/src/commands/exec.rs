use std::io::Read;
use std::path::Path;
use std::process;
use std::time::Duration;

use waymark_engine::{Command, DecideError, Event};

use super::load_config;
use crate::runtime::Runtime;
use crate::{report_error, tokio_runtime, OutputFormat};

/// How long `exec` waits for queued mirror submissions before exiting.
const MIRROR_GRACE: Duration = Duration::from_secs(30);

pub(crate) fn cmd_exec(config_path: &Path, commands_path: &Path, output: OutputFormat, quiet: bool) {
    let config = load_config(config_path, output, quiet);
    let commands = match read_commands(commands_path) {
        Ok(c) => c,
        Err(e) => {
            report_error(&e, output, quiet);
            process::exit(1);
        }
    };

    let rt = tokio_runtime(output, quiet);
    let outcomes = rt.block_on(async {
        let runtime = Runtime::build(&config)?;
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in &commands {
            outcomes.push(runtime.router.dispatch(command).await);
        }
        runtime.shutdown(MIRROR_GRACE).await;
        Ok::<_, String>(outcomes)
    });
    let outcomes = match outcomes {
        Ok(o) => o,
        Err(e) => {
            report_error(&e, output, quiet);
            process::exit(1);
        }
    };

    let rejected = outcomes.iter().filter(|o| o.is_err()).count();
    match output {
        OutputFormat::Json => {
            let results: Vec<serde_json::Value> = commands
                .iter()
                .zip(&outcomes)
                .map(|(command, outcome)| outcome_json(command, outcome))
                .collect();
            let json = serde_json::to_string_pretty(&results)
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
            println!("{}", json);
        }
        OutputFormat::Text => {
            for (command, outcome) in commands.iter().zip(&outcomes) {
                match outcome {
                    Ok(event) => {
                        if !quiet {
                            println!(
                                "accepted {} {} v{}: {} -> {}",
                                event.entity_type,
                                event.entity_id,
                                event.version,
                                event.event_type,
                                event.to_state
                            );
                        }
                    }
                    Err(e) => report_error(
                        &format!(
                            "rejected {} {} {} ({}): {}",
                            command.entity_type,
                            command.entity_id,
                            command.command_type,
                            e.kind(),
                            e
                        ),
                        output,
                        quiet,
                    ),
                }
            }
        }
    }

    if rejected > 0 {
        process::exit(1);
    }
}

/// One command or an array of commands, from a file or stdin (`-`).
fn read_commands(path: &Path) -> Result<Vec<Command>, String> {
    let content = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("error reading stdin: {}", e))?;
        buf
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| format!("error reading file '{}': {}", path.display(), e))?
    };
    parse_commands(&content).map_err(|e| format!("error parsing commands in '{}': {}", path.display(), e))
}

fn parse_commands(content: &str) -> Result<Vec<Command>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    match value {
        serde_json::Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

fn outcome_json(command: &Command, outcome: &Result<Event, DecideError>) -> serde_json::Value {
    match outcome {
        Ok(event) => serde_json::json!({ "accepted": true, "event": event }),
        Err(e) => serde_json::json!({
            "accepted": false,
            "command_id": command.id,
            "error": e.kind(),
            "message": e.to_string(),
            "retryable": e.is_retryable(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_and_array_both_parse() {
        let one = parse_commands(
            r#"{"entity_type":"file","entity_id":"f1","type":"delete","requester":"ops"}"#,
        )
        .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].command_type, "delete");

        let many = parse_commands(
            r#"[
                {"entity_type":"file","entity_id":"f1","command_type":"log","requester":"a","payload":{"action":"viewed"}},
                {"entity_type":"file","entity_id":"f2","command_type":"delete","requester":"a"}
            ]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].payload_str("action"), Some("viewed"));
    }

    #[test]
    fn malformed_commands_are_errors() {
        assert!(parse_commands("{").is_err());
        assert!(parse_commands(r#"{"entity_id":"f1"}"#).is_err());
    }

    #[test]
    fn rejection_json_carries_kind() {
        let command = Command::new("file", "f1", "delete", "bob");
        let err = DecideError::Busy {
            entity_id: "f1".to_string(),
        };
        let value = outcome_json(&command, &Err(err));
        assert_eq!(value["error"], serde_json::json!("busy"));
        assert_eq!(value["retryable"], serde_json::json!(true));
    }
}
