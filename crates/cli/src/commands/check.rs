use std::path::Path;
use std::process;

use waymark_engine::{file, MachineDefinition, INITIAL_STATE};

use crate::{report_error, OutputFormat};

pub(crate) fn cmd_check(file: Option<&Path>, output: OutputFormat, quiet: bool) {
    let (machine, source) = match load(file) {
        Ok(m) => m,
        Err(e) => {
            report_error(&e, output, quiet);
            process::exit(1);
        }
    };

    if quiet {
        return;
    }
    match output {
        OutputFormat::Json => {
            let entities: Vec<serde_json::Value> = machine
                .entity_types()
                .filter_map(|t| machine.entity(t))
                .map(|m| {
                    serde_json::json!({
                        "type": m.entity_type,
                        "states": m.states,
                        "rules": m.rules().collect::<Vec<_>>(),
                    })
                })
                .collect();
            let report = serde_json::json!({ "source": source, "entities": entities });
            let json = serde_json::to_string_pretty(&report)
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
            println!("{}", json);
        }
        OutputFormat::Text => {
            println!("Machine: {}", source);
            for entity in machine.entity_types().filter_map(|t| machine.entity(t)) {
                println!();
                println!(
                    "  {} ({} states: {})",
                    entity.entity_type,
                    entity.states.len(),
                    entity.states.iter().cloned().collect::<Vec<_>>().join(", ")
                );
                for rule in entity.rules() {
                    let from = if rule.from_states.is_empty() {
                        "*".to_string()
                    } else {
                        rule.from_states
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join("|")
                    };
                    println!(
                        "    {:<12} {} -> {}  emits {}  requires {}",
                        rule.command_type, from, rule.to_state, rule.event_type, rule.required_capability
                    );
                }
            }
            println!();
            println!("OK: every state reachable from {}", INITIAL_STATE);
        }
    }
}

fn load(path: Option<&Path>) -> Result<(MachineDefinition, String), String> {
    match path {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .map_err(|e| format!("error reading file '{}': {}", path.display(), e))?;
            let machine = MachineDefinition::from_toml_str(&source)
                .map_err(|e| format!("invalid machine '{}': {}", path.display(), e))?;
            Ok((machine, path.display().to_string()))
        }
        None => file::machine()
            .map(|m| (m, "built-in file lifecycle".to_string()))
            .map_err(|e| format!("built-in file machine: {}", e)),
    }
}
