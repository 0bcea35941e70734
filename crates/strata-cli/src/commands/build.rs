use super::{
    core_err, json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_FAILURE, EXIT_SUCCESS,
};
use std::path::Path;
use std::time::Duration;
use strata_core::shutdown_requested;
use strata_schema::BuildRequest;
use tracing::debug;

const POLL: Duration = Duration::from_millis(200);

pub fn run(ctx: &Context, request_path: &Path) -> Result<u8, String> {
    let request =
        BuildRequest::from_file(request_path).map_err(|e| format!("request error: {e}"))?;
    let machine_id = request.machine_id.clone();
    let orchestrator = ctx.open()?;

    let accepted = orchestrator.build(request).map_err(core_err)?;
    debug!("[{machine_id}] build accepted as {}", accepted.run_id);

    let pb = if ctx.json {
        None
    } else {
        Some(spinner(&format!("building {machine_id}...")))
    };

    let mut stream = orchestrator
        .subscribe(&accepted.run_id)
        .ok_or_else(|| format!("run {} has no event stream", accepted.run_id))?;
    let mut cancelled = false;
    loop {
        match stream.next_timeout(POLL) {
            Some(event) if event.is_terminal() => break,
            Some(event) => {
                if let Some(ref pb) = pb {
                    pb.set_message(format!("[{:>2}%] {}", event.percentage, event.message));
                }
            }
            None => {
                if shutdown_requested() && !cancelled {
                    cancelled = true;
                    if let Some(ref pb) = pb {
                        pb.set_message("cancelling...");
                    }
                    orchestrator.shutdown();
                }
            }
        }
    }
    let terminal = orchestrator.wait(&accepted.run_id).map_err(core_err)?;

    if ctx.json {
        let payload = serde_json::json!({
            "run_id": accepted.run_id,
            "machine_id": machine_id,
            "state": terminal.status,
            "error": terminal.error,
        });
        println!("{}", json_pretty(&payload)?);
    } else if terminal.is_error() {
        if let Some(ref pb) = pb {
            spin_fail(pb, &format!("build of {machine_id} failed: {}", terminal.error));
        }
    } else if let Some(ref pb) = pb {
        spin_ok(pb, &format!("{machine_id} is {}", terminal.status));
        println!("run_id: {}", accepted.run_id);
    }

    if terminal.is_error() {
        Ok(EXIT_FAILURE)
    } else {
        Ok(EXIT_SUCCESS)
    }
}
