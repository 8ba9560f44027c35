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

//! Kubernetes resource quantities, e.g. `100m`, `1.5`, `128Mi`, `1G`, `2e3`.

use crate::SkyletError;

const NUMERIC_CHARS: &str = "0123456789.+-";

fn multiplier(suffix: &str) -> Option<f64> {
    let m = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => {
            let exp = suffix.strip_prefix(['e', 'E'])?;
            10f64.powi(exp.parse::<i32>().ok()?)
        }
    };

    Some(m)
}

/// Parses a quantity into its value in base units.
pub fn parse(quantity: &str) -> Result<f64, SkyletError> {
    let q = quantity.trim();
    let split = q
        .find(|c: char| !NUMERIC_CHARS.contains(c))
        .unwrap_or(q.len());
    let (number, suffix) = q.split_at(split);

    let value = number
        .parse::<f64>()
        .map_err(|_| SkyletError::InvalidConfig(format!("<{quantity}> is not a valid quantity")))?;
    let multiplier = multiplier(suffix).ok_or_else(|| {
        SkyletError::InvalidConfig(format!("<{quantity}> has an unknown suffix <{suffix}>"))
    })?;

    let value = value * multiplier;
    if !value.is_finite() || value < 0.0 {
        return Err(SkyletError::InvalidConfig(format!(
            "<{quantity}> is not a valid quantity"
        )));
    }

    Ok(value)
}

/// Rounds up, ignoring floating point noise such as `0.1 * 1000 = 100.00000000000001`.
fn ceil(value: f64) -> u64 {
    let rounded = value.round();
    if (value - rounded).abs() < 1e-6 {
        rounded as u64
    } else {
        value.ceil() as u64
    }
}

pub fn cpu_millis(quantity: &str) -> Result<u64, SkyletError> {
    Ok(ceil(parse(quantity)? * 1000.0))
}

pub fn memory_bytes(quantity: &str) -> Result<u64, SkyletError> {
    Ok(ceil(parse(quantity)?))
}

/// A whole count, such as the pod ceiling of a node.
pub fn count(quantity: &str) -> Result<u64, SkyletError> {
    let value = parse(quantity)?;
    if value.fract() != 0.0 {
        return Err(SkyletError::InvalidConfig(format!(
            "<{quantity}> is not a whole number"
        )));
    }

    Ok(value as u64)
}
