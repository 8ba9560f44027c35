/*
Copyright 2025 The Skylet Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::error::Error;

use comfy_table::presets::NOTHING;
use comfy_table::Table;
use gethostname::gethostname;

use common::ctx::ProviderConfig;
use skylet::capacity::CapacityReporter;

pub fn run(config: &ProviderConfig, node_name: &Option<String>) -> Result<(), Box<dyn Error>> {
    let node_name = node_name
        .clone()
        .unwrap_or(gethostname().to_string_lossy().to_string());
    let reporter = CapacityReporter::new(config);

    println!("{:<15}{}", "Node:", node_name);
    println!("{:<15}{}", "OS:", config.operating_system);
    println!("{:<15}", "Capacity:");
    for (name, quantity) in reporter.capacity() {
        println!("  {:<13}{}", name, quantity.0);
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_header(vec!["Type", "Status", "Heartbeat", "Reason", "Message"]);

    for cond in reporter.node_conditions() {
        table.add_row(vec![
            cond.type_,
            cond.status,
            cond.last_heartbeat_time
                .map(|t| t.0.format("%T").to_string())
                .unwrap_or("-".to_string()),
            cond.reason.unwrap_or_default(),
            cond.message.unwrap_or_default(),
        ]);
    }

    println!("{table}");

    Ok(())
}
