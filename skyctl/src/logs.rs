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

use common::ctx::ProviderConfig;
use skylet::backend;
use skylet::model::WorkloadHandle;

pub async fn run(
    config: &ProviderConfig,
    workload: &str,
    container: &str,
    tail: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let backend = backend::new(config)?;
    let handle = WorkloadHandle {
        scope: backend.scope(),
        id: workload.to_string(),
        revision: String::new(),
    };

    tracing::debug!("Fetch logs of <{container}> in <{handle}>");

    let logs = backend.fetch_logs(&handle, container, tail).await?;
    println!("{}", String::from_utf8_lossy(&logs));

    Ok(())
}
