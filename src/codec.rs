//! JSON serialization of group views, to strings and to group files.
//!
//! Wire form:
//!
//! ```json
//! { "transport": "tcp",
//!   "credentials": 42,
//!   "members": [ { "address": "...", "provider_id": 0 }, ... ],
//!   "metadata": { "key": "value" } }
//! ```
//!
//! Ranks are implicit by position: deserialization assigns ranks `0..n`
//! in member order. Group files are written atomically through a `.swp`
//! sibling so readers only ever observe a complete file.

use crate::types::{Credentials, FlockError};
use crate::view::GroupView;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMember {
    pub address: String,
    pub provider_id: u16,
}

/// Serialized form of a group: the view content plus the transport tag and
/// credentials a handle needs to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireView {
    pub transport: String,
    #[serde(default)]
    pub credentials: Credentials,
    pub members: Vec<WireMember>,
    // BTreeMap keeps key order stable so equal views serialize identically
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl WireView {
    /// Snapshot a view into wire form. Members are emitted in rank order.
    pub fn from_view(view: &GroupView, transport: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            transport: transport.into(),
            credentials,
            members: view
                .members()
                .iter()
                .map(|m| WireMember { address: m.address.clone(), provider_id: m.provider_id })
                .collect(),
            metadata: view
                .metadata()
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect(),
        }
    }

    /// Rebuild a view, assigning ranks positionally.
    pub fn to_view(&self) -> GroupView {
        let mut view = GroupView::new();
        for (rank, m) in self.members.iter().enumerate() {
            // identities were validated as unique on decode
            let _ = view.add_member(rank as u64, m.provider_id, m.address.clone());
        }
        for (key, value) in &self.metadata {
            view.add_metadata(key.clone(), value.clone());
        }
        view
    }
}

/// Parse and validate a serialized group.
///
/// Every structural violation surfaces as `InvalidConfig` naming the
/// offending field; nothing is constructed from a partially valid document.
pub fn decode(text: &str) -> Result<WireView, FlockError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FlockError::InvalidConfig(format!("group is not valid JSON: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| FlockError::InvalidConfig("group must be a JSON object".into()))?;

    let transport = match obj.get("transport") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(_) => return Err(FlockError::InvalidConfig("\"transport\" must be a string".into())),
        None => return Err(FlockError::InvalidConfig("missing \"transport\" field".into())),
    };

    let credentials = match obj.get("credentials") {
        Some(v) => v
            .as_i64()
            .ok_or_else(|| FlockError::InvalidConfig("\"credentials\" must be an integer".into()))?,
        None => 0,
    };

    let members_value = obj
        .get("members")
        .ok_or_else(|| FlockError::InvalidConfig("missing \"members\" field".into()))?;
    let members_array = members_value
        .as_array()
        .ok_or_else(|| FlockError::InvalidConfig("\"members\" must be an array".into()))?;
    if members_array.is_empty() {
        return Err(FlockError::InvalidConfig("\"members\" must not be empty".into()));
    }

    let mut members = Vec::with_capacity(members_array.len());
    for (i, entry) in members_array.iter().enumerate() {
        let member = entry.as_object().ok_or_else(|| {
            FlockError::InvalidConfig(format!("members[{i}] must be an object"))
        })?;
        let address = match member.get("address") {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => {
                return Err(FlockError::InvalidConfig(format!(
                    "members[{i}].address must be a string"
                )));
            }
        };
        let provider_id = member
            .get("provider_id")
            .and_then(|v| v.as_u64())
            .filter(|&v| v <= u16::MAX as u64)
            .ok_or_else(|| {
                FlockError::InvalidConfig(format!(
                    "members[{i}].provider_id must be an integer in [0, 65535]"
                ))
            })? as u16;
        members.push(WireMember { address, provider_id });
    }

    let mut seen = std::collections::HashSet::new();
    for m in &members {
        if !seen.insert((m.address.as_str(), m.provider_id)) {
            return Err(FlockError::InvalidConfig(format!(
                "duplicate member {}#{}",
                m.address, m.provider_id
            )));
        }
    }

    let mut metadata = BTreeMap::new();
    if let Some(md) = obj.get("metadata") {
        let map = md
            .as_object()
            .ok_or_else(|| FlockError::InvalidConfig("\"metadata\" must be an object".into()))?;
        for (key, v) in map {
            let value = v.as_str().ok_or_else(|| {
                FlockError::InvalidConfig(format!("metadata[{key:?}] must be a string"))
            })?;
            metadata.insert(key.clone(), value.to_string());
        }
    }

    Ok(WireView { transport, credentials, members, metadata })
}

pub fn encode(wire: &WireView) -> String {
    // WireView serialization cannot fail: string keys, no non-finite floats
    serde_json::to_string_pretty(wire).expect("serializing a group view")
}

/// Read and validate a group file.
pub fn read_group_file(path: impl AsRef<Path>) -> Result<WireView, FlockError> {
    let text = std::fs::read_to_string(path)?;
    decode(&text)
}

/// Write a group file atomically: serialize to `<path>.swp`, flush to
/// disk, then rename over `<path>`. Readers observe either the previous
/// complete file or the new one.
pub fn write_group_file(path: impl AsRef<Path>, wire: &WireView) -> Result<(), FlockError> {
    let path = path.as_ref();
    let mut swap = path.as_os_str().to_owned();
    swap.push(".swp");

    let mut file = File::create(&swap)?;
    file.write_all(encode(wire).as_bytes())?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&swap, path)?;
    Ok(())
}
