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

//! AWS Signature Version 4 request signing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use common::BackendError;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

pub const HEADER_DATE: &str = "x-amz-date";
pub const HEADER_SECURITY_TOKEN: &str = "x-amz-security-token";
pub const HEADER_AUTHORIZATION: &str = "authorization";

type HmacSha256 = Hmac<Sha256>;

pub struct Signer<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub session_token: Option<&'a str>,
    pub region: &'a str,
    pub service: &'a str,
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>, BackendError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| BackendError::Permanent(format!("invalid signing key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn signing_key(
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, BackendError> {
    let k_date = hmac(format!("AWS4{secret_key}").as_bytes(), date)?;
    let k_region = hmac(&k_date, region)?;
    let k_service = hmac(&k_region, service)?;
    hmac(&k_service, "aws4_request")
}

/// Percent-encodes everything but the RFC 3986 unreserved characters.
fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();

    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Returns the canonical request and the signed header list. Header names
/// must already be lowercase.
pub fn canonical_request(
    method: &str,
    url: &Url,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
) -> (String, String) {
    let path = match url.path() {
        "" => "/",
        p => p,
    };

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let request = format!(
        "{method}\n{path}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        canonical_query(url)
    );

    (request, signed_headers)
}

impl Signer<'_> {
    /// Adds the date, token and authorization headers to `headers`.
    /// `headers` must contain `host` and every other header to be signed.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &mut BTreeMap<String, String>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        headers.insert(HEADER_DATE.to_string(), amz_date.clone());
        if let Some(token) = self.session_token {
            headers.insert(HEADER_SECURITY_TOKEN.to_string(), token.to_string());
        }

        let (request, signed_headers) =
            canonical_request(method, url, headers, &sha256_hex(body));

        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            sha256_hex(request.as_bytes())
        );

        let key = signing_key(self.secret_key, &date, self.region, self.service)?;
        let signature = hex::encode(hmac(&key, &string_to_sign)?);

        headers.insert(
            HEADER_AUTHORIZATION.to_string(),
            format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key
            ),
        );

        Ok(())
    }
}
