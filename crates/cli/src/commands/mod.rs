mod check;
mod exec;
mod keygen;
mod reconcile;
mod replay;

pub(crate) use check::cmd_check;
pub(crate) use exec::cmd_exec;
pub(crate) use keygen::cmd_keygen;
pub(crate) use reconcile::cmd_reconcile;
pub(crate) use replay::{cmd_replay, report_json as rebuild_json};

use std::path::Path;
use std::process;

use crate::config::{read_config, WaymarkConfig};
use crate::{report_error, OutputFormat};

/// Read the config or exit with status 1.
fn load_config(path: &Path, output: OutputFormat, quiet: bool) -> WaymarkConfig {
    match read_config(path) {
        Ok(c) => c,
        Err(e) => {
            report_error(&e, output, quiet);
            process::exit(1);
        }
    }
}
