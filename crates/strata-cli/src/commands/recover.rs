use super::{core_err, json_pretty, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, grace_secs: Option<u64>) -> Result<u8, String> {
    let mut config = ctx.config()?;
    if let Some(grace) = grace_secs {
        config.recovery_grace_secs = grace;
    }
    let orchestrator = ctx.builder(config)?.build();
    let report = orchestrator.recover().map_err(core_err)?;

    if ctx.json {
        let payload = serde_json::json!({
            "reverted": report.reverted,
            "removed": report.removed,
            "skipped": report.skipped,
        });
        println!("{}", json_pretty(&payload)?);
    } else if report.reverted.is_empty() && report.removed == 0 {
        println!("nothing to recover ({} run(s) still pending)", report.skipped);
    } else {
        for machine in &report.reverted {
            println!("reverted {machine}");
        }
        println!(
            "recovered {} machine(s), cleared {} journal entr(ies), {} pending",
            report.reverted.len(),
            report.removed,
            report.skipped
        );
    }
    Ok(EXIT_SUCCESS)
}
