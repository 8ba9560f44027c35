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

fn show(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

fn secret(value: &Option<String>) -> &str {
    match value {
        Some(_) => "<redacted>",
        None => "-",
    }
}

pub fn run(config: &ProviderConfig) -> Result<(), Box<dyn Error>> {
    let creds = &config.credentials;

    println!("{:<20}{}", "Backend:", config.backend);
    println!("{:<20}{}", "Region:", config.region);
    println!("{:<20}{}", "Cluster:", config.cluster);
    println!("{:<20}{}", "SubscriptionID:", show(&config.subscription_id));
    println!("{:<20}{}", "CPU:", config.cpu);
    println!("{:<20}{}", "Memory:", config.memory);
    println!("{:<20}{}", "Pods:", config.pods);
    println!("{:<20}{}", "OperatingSystem:", config.operating_system);
    println!("{:<20}{}", "LogGroup:", config.log_group);
    println!("{:<20}{}", "ExecutionRoleArn:", show(&config.execution_role_arn));
    println!("{:<20}", "Credentials:");
    println!("  {:<18}{}", "AccessKey:", show(&creds.access_key));
    println!("  {:<18}{}", "SecretKey:", secret(&creds.secret_key));
    println!("  {:<18}{}", "SessionToken:", secret(&creds.session_token));
    println!("  {:<18}{}", "AzureToken:", secret(&creds.azure_token));

    Ok(())
}
