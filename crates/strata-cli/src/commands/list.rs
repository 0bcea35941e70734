use super::{colorize_state, json_pretty, Context, EXIT_SUCCESS};
use strata_store::MachineStore;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let machines = MachineStore::new(ctx.layout())
        .list()
        .map_err(|e| format!("store error: {e}"))?;
    if ctx.json {
        println!("{}", json_pretty(&machines)?);
    } else if machines.is_empty() {
        println!("no machines found");
    } else {
        println!(
            "{:<24} {:<16} {:<28} {:<16} UPDATED",
            "MACHINE_ID", "STATE", "INSTANCE", "IP"
        );
        for machine in &machines {
            let (instance, ip) = machine
                .data
                .as_ref()
                .map_or(("", ""), |d| (d.instance_name.as_str(), d.ip_address.as_str()));
            println!(
                "{:<24} {:<16} {:<28} {:<16} {}",
                machine.machine_id,
                colorize_state(machine.state),
                instance,
                ip,
                machine.updated_at
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
