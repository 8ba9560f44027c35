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

use common::ctx::ProviderConfig;
use skylet::backend;

pub async fn run(config: &ProviderConfig) -> Result<(), Box<dyn Error>> {
    let backend = backend::new(config)?;
    let mut workloads = backend.list_workloads(&backend.scope()).await?;
    workloads.sort_by(|(l, _), (r, _)| l.id.cmp(&r.id));

    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_header(vec!["ID", "Revision", "Phase", "IP", "Started", "Containers"]);

    for (handle, status) in &workloads {
        let containers: Vec<String> = status
            .containers
            .iter()
            .map(|c| format!("{}({})", c.name, c.phase))
            .collect();

        table.add_row(vec![
            handle.id.clone(),
            handle.revision.clone(),
            status.phase.to_string(),
            status.ip.clone().unwrap_or("-".to_string()),
            status
                .started_at
                .map(|t| t.format("%F %T").to_string())
                .unwrap_or("-".to_string()),
            containers.join(", "),
        ]);
    }

    println!("{table}");

    Ok(())
}
