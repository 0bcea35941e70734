use super::{colorize_state, json_pretty, Context, EXIT_SUCCESS};
use strata_schema::{MachineId, MachineState};
use strata_store::{MachineStore, StoreError};

pub fn run(ctx: &Context, machine_id: &str) -> Result<u8, String> {
    let id = MachineId::new(machine_id);
    if !id.is_path_safe() {
        return Err(format!("request error: invalid machine id '{machine_id}'"));
    }
    let record = match MachineStore::new(ctx.layout()).get(&id) {
        Ok(record) => Some(record),
        Err(StoreError::MachineNotFound(_)) => None,
        Err(e) => return Err(format!("store error: {e}")),
    };

    if ctx.json {
        let payload = match record {
            Some(ref r) => serde_json::to_value(r).map_err(|e| e.to_string())?,
            None => serde_json::json!({
                "machine_id": machine_id,
                "state": MachineState::NotInitialized,
            }),
        };
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    let Some(record) = record else {
        println!("machine {machine_id}: {}", MachineState::NotInitialized);
        return Ok(EXIT_SUCCESS);
    };
    println!("machine {}: {}", record.machine_id, colorize_state(record.state));
    println!("updated: {}", record.updated_at);
    if let Some(ref data) = record.data {
        println!("username: {}", data.username);
        println!("instance: {} ({})", data.instance_name, data.instance_id);
        println!("domain:   {}", data.domain_name);
        println!("ip:       {}", data.ip_address);
        println!("query:    {}", data.query_string);
    }
    Ok(EXIT_SUCCESS)
}
