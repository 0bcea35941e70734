pub mod build;
pub mod completions;
pub mod events;
pub mod list;
pub mod recover;
pub mod status;
pub mod verify_store;

use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use strata_core::{CoreError, Orchestrator, OrchestratorBuilder, OrchestratorConfig};
use strata_schema::MachineState;
use strata_store::StoreLayout;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_REQUEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// Global options shared by every command.
pub struct Context {
    pub store_path: PathBuf,
    config_path: Option<PathBuf>,
    pub json: bool,
}

impl Context {
    pub fn new(store_path: PathBuf, config_path: Option<PathBuf>, json: bool) -> Self {
        Self {
            store_path,
            config_path,
            json,
        }
    }

    pub fn layout(&self) -> StoreLayout {
        StoreLayout::new(&self.store_path)
    }

    pub fn config(&self) -> Result<OrchestratorConfig, String> {
        let path = self
            .config_path
            .clone()
            .unwrap_or_else(|| self.layout().config_file());
        OrchestratorConfig::load_or_default(&path).map_err(|e| format!("request error: {e}"))
    }

    /// Orchestrator over the store, without running the recovery sweep.
    pub fn builder(&self, config: OrchestratorConfig) -> Result<OrchestratorBuilder, String> {
        Ok(OrchestratorBuilder::persistent(self.layout())
            .map_err(core_err)?
            .with_config(config)
            .skip_recovery())
    }

    pub fn open(&self) -> Result<Orchestrator, String> {
        Orchestrator::open(&self.store_path, self.config()?).map_err(core_err)
    }
}

/// Render a core error with the prefix the exit-code mapping keys on.
pub fn core_err(e: CoreError) -> String {
    match e {
        CoreError::StoreFailure(_) => e.to_string(),
        CoreError::Io(_) => format!("store error: {e}"),
        e if e.is_user_visible() => format!("request error: {e}"),
        e => e.to_string(),
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(finish_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(finish_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: MachineState) -> String {
    use console::Style;
    let name = state.as_str();
    match state {
        MachineState::Running => Style::new().green().bold().apply_to(name).to_string(),
        MachineState::Building | MachineState::Starting | MachineState::Rebooting => {
            Style::new().cyan().apply_to(name).to_string()
        }
        MachineState::Stopping | MachineState::Stopped => {
            Style::new().yellow().apply_to(name).to_string()
        }
        MachineState::Terminating | MachineState::Terminated => {
            Style::new().dim().apply_to(name).to_string()
        }
        MachineState::Unknown => Style::new().red().apply_to(name).to_string(),
        MachineState::NotInitialized => name.to_owned(),
    }
}
