use std::process;

use multinic_agent::agent;

fn main() {
    if let Err(e) = agent::run() {
        // Use eprintln! here in case the logger did not initialize.
        eprintln!("Failed to run agent: {:#}", e);
        process::exit(1);
    }
}
