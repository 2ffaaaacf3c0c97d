//! Probe report structures
//!
//! One report per invocation, assembled from whatever the network
//! answered. Field names match the established wire format of the HTTP
//! endpoint; unknown fields are rejected on the way in, absent optional
//! fields default to empty.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of asking one peer whether it holds a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BitswapCheckOutput {
    /// Round-trip duration of the probe, in nanoseconds on the wire.
    #[serde(rename = "Duration", with = "duration_nanos", default)]
    pub duration: Duration,
    /// Peer affirmatively claims to hold the block.
    #[serde(rename = "Found", default)]
    pub found: bool,
    /// Peer replied at all, positively or negatively.
    #[serde(rename = "Responded", default)]
    pub responded: bool,
    /// Error encountered during the probe, empty on success.
    #[serde(rename = "Error", default)]
    pub error: String,
}

/// Report for one provider discovered during a CID check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderOutput {
    /// Provider peer identity.
    #[serde(rename = "ID")]
    pub id: String,
    /// Connection error, empty if the dial succeeded.
    #[serde(rename = "ConnectionError", default)]
    pub connection_error: String,
    /// Public transport addresses the provider advertised.
    #[serde(rename = "Addrs", default)]
    pub addrs: Vec<String>,
    /// Remote multiaddrs of the connections actually established. After a
    /// hole punch this typically holds both a relay path and a direct one.
    #[serde(rename = "ConnectionMaddrs", default)]
    pub connection_maddrs: Vec<String>,
    #[serde(rename = "DataAvailableOverBitswap", default)]
    pub data_available_over_bitswap: BitswapCheckOutput,
}

/// Report for a peer check (CID plus peer descriptor).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerCheckOutput {
    /// Connection error, empty if the dial succeeded.
    #[serde(rename = "ConnectionError", default)]
    pub connection_error: String,
    /// Address string → number of DHT peers whose closest-peer reply
    /// contained it. Higher counts mean independent corroboration.
    #[serde(rename = "PeerFoundInDHT", default)]
    pub peer_found_in_dht: HashMap<String, u32>,
    /// Whether the target peer itself appears among the CID's providers.
    #[serde(rename = "ProviderRecordFromPeerInDHT", default)]
    pub provider_record_from_peer_in_dht: bool,
    /// Remote multiaddrs of the connections actually established.
    #[serde(rename = "ConnectionMaddrs", default)]
    pub connection_maddrs: Vec<String>,
    #[serde(rename = "DataAvailableOverBitswap", default)]
    pub data_available_over_bitswap: BitswapCheckOutput,
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitswap_output_field_names() {
        let out = BitswapCheckOutput {
            duration: Duration::from_millis(120),
            found: true,
            responded: true,
            error: String::new(),
        };
        let v: serde_json::Value = serde_json::to_value(&out).unwrap();
        assert_eq!(v["Duration"], 120_000_000u64);
        assert_eq!(v["Found"], true);
        assert_eq!(v["Responded"], true);
        assert_eq!(v["Error"], "");
    }

    #[test]
    fn test_provider_output_roundtrip() {
        let out = ProviderOutput {
            id: "QmYyQSo1c1Ym7orWxLYvCrM2EmxFTANf8wXmmE7DWjhx5N".into(),
            connection_error: String::new(),
            addrs: vec!["/ip4/203.0.113.7/tcp/4001".into()],
            connection_maddrs: vec!["/ip4/203.0.113.7/tcp/4001".into()],
            data_available_over_bitswap: BitswapCheckOutput {
                duration: Duration::from_secs(1),
                found: true,
                responded: true,
                error: String::new(),
            },
        };
        let json = serde_json::to_string(&out).unwrap();
        let back: ProviderOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, out.id);
        assert_eq!(back.addrs, out.addrs);
        assert!(back.data_available_over_bitswap.found);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let back: PeerCheckOutput = serde_json::from_str("{}").unwrap();
        assert_eq!(back.connection_error, "");
        assert!(back.peer_found_in_dht.is_empty());
        assert!(!back.provider_record_from_peer_in_dht);
        assert!(back.connection_maddrs.is_empty());
        assert!(!back.data_available_over_bitswap.responded);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let r: Result<PeerCheckOutput, _> =
            serde_json::from_str(r#"{"Bogus": 1}"#);
        assert!(r.is_err());
        let r: Result<ProviderOutput, _> =
            serde_json::from_str(r#"{"ID": "x", "Extra": []}"#);
        assert!(r.is_err());
    }

    #[test]
    fn test_peer_output_dht_counts() {
        let mut out = PeerCheckOutput::default();
        out.peer_found_in_dht
            .insert("/ip4/203.0.113.7/tcp/4001".into(), 7);
        let v: serde_json::Value = serde_json::to_value(&out).unwrap();
        assert_eq!(v["PeerFoundInDHT"]["/ip4/203.0.113.7/tcp/4001"], 7);
        assert_eq!(v["ProviderRecordFromPeerInDHT"], false);
    }
}
