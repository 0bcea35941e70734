use super::{colorize_state, json_pretty, Context, EXIT_SUCCESS};
use strata_schema::RunId;
use strata_store::{read_event_log, StoreError};

pub fn run(ctx: &Context, run_id: &str) -> Result<u8, String> {
    let id = RunId::new(run_id);
    if !id.is_path_safe() {
        return Err(format!("request error: invalid run id '{run_id}'"));
    }
    let path = ctx.layout().event_log_path(&id);
    if !path.exists() {
        let missing = StoreError::RunNotFound(run_id.to_owned());
        return Err(format!("request error: {missing}"));
    }
    let events = read_event_log(&path).map_err(|e| format!("store error: {e}"))?;

    if ctx.json {
        println!("{}", json_pretty(&events)?);
        return Ok(EXIT_SUCCESS);
    }
    for event in &events {
        let status = colorize_state(event.status);
        if event.is_terminal() {
            if event.is_error() {
                println!("{:>3}% {status} error: {}", event.percentage, event.error);
            } else {
                println!("{:>3}% {status} done", event.percentage);
            }
        } else {
            println!("{:>3}% {status} {}", event.percentage, event.message);
        }
    }
    if !events.last().is_some_and(strata_schema::ProgressEvent::is_terminal) {
        println!("(run has not finished)");
    }
    Ok(EXIT_SUCCESS)
}
