use super::{json_pretty, Context, EXIT_STORE_ERROR, EXIT_SUCCESS};
use strata_store::verify_store_integrity;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let report =
        verify_store_integrity(&ctx.layout()).map_err(|e| format!("store error: {e}"))?;

    if ctx.json {
        let payload = serde_json::json!({
            "checked": report.checked,
            "passed": report.passed,
            "failed": report.failed.len(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "store integrity: {}/{} machine records passed",
            report.passed, report.checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.machine_id, f.reason);
        }
    }

    if report.failed.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
