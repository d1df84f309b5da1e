//! Gamedata: signature declarations loaded from JSON
//!
//! Signatures ship in a gamedata.json file next to the config so they can be
//! updated for a new host build without recompiling.
//!
//! ```json
//! {
//!     "Tick": {
//!         "required": true,
//!         "pattern": "51 53 68 FF FF 0F 00 68 1F 00 09 00 C6 05 ? ? ? ? 01",
//!         "lowest": "0x401000"
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::address::Address;
use crate::error::EngineError;
use crate::signature::{Pattern, Signature};

/// Errors that can occur when loading gamedata
#[derive(Debug, Error)]
pub enum GamedataError {
    #[error("Failed to read gamedata file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse gamedata JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Signature not found in gamedata: {0}")]
    SignatureNotFound(String),

    #[error("Invalid pattern for '{name}': {source}")]
    InvalidSignature {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("Invalid address for '{name}': {value}")]
    InvalidAddress { name: String, value: String },
}

/// Address as written in gamedata: a number or a hex string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressValue {
    Number(u64),
    Text(String),
}

impl AddressValue {
    fn parse(&self, name: &str) -> Result<Address, GamedataError> {
        let invalid = |value: String| GamedataError::InvalidAddress {
            name: name.to_string(),
            value,
        };

        let raw = match self {
            AddressValue::Number(n) => *n,
            AddressValue::Text(text) => {
                let trimmed = text.trim();
                let parsed = match trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => trimmed.parse(),
                };
                parsed.map_err(|_| invalid(text.clone()))?
            }
        };

        usize::try_from(raw)
            .map(Address::new)
            .map_err(|_| invalid(raw.to_string()))
    }
}

/// One signature declaration
#[derive(Debug, Clone, Deserialize)]
pub struct SignatureEntry {
    #[serde(default = "default_required")]
    pub required: bool,
    pub pattern: String,
    #[serde(default)]
    pub lowest: Option<AddressValue>,
    #[serde(default)]
    pub highest: Option<AddressValue>,
}

fn default_required() -> bool {
    true
}

/// Loaded gamedata
#[derive(Debug, Default)]
pub struct Gamedata {
    signatures: BTreeMap<String, SignatureEntry>,
}

impl Gamedata {
    /// Load gamedata from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GamedataError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Load gamedata from a JSON string
    pub fn load_from_str(json: &str) -> Result<Self, GamedataError> {
        let signatures: BTreeMap<String, SignatureEntry> = serde_json::from_str(json)?;
        let gamedata = Gamedata { signatures };

        // Surface bad patterns at load time rather than at first resolve
        for name in gamedata.signatures.keys() {
            gamedata.signature(name)?;
        }

        tracing::info!("Loaded gamedata: {} signatures", gamedata.signatures.len());
        Ok(gamedata)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Signature names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signatures.keys().map(String::as_str)
    }

    pub fn entry(&self, name: &str) -> Option<&SignatureEntry> {
        self.signatures.get(name)
    }

    /// Build the named signature
    pub fn signature(&self, name: &str) -> Result<Signature, GamedataError> {
        let entry = self
            .signatures
            .get(name)
            .ok_or_else(|| GamedataError::SignatureNotFound(name.to_string()))?;

        let pattern =
            Pattern::parse(&entry.pattern).map_err(|source| GamedataError::InvalidSignature {
                name: name.to_string(),
                source,
            })?;

        let lowest = entry.lowest.as_ref().map(|v| v.parse(name)).transpose()?;
        let highest = entry.highest.as_ref().map(|v| v.parse(name)).transpose()?;

        Ok(Signature::new(name, entry.required, pattern).bounded(lowest, highest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_gamedata() {
        let json = r#"{
            "Tick": {
                "required": true,
                "pattern": "51 53 68 FF FF 0F 00 68 1F 00 09 00 C6 05 ? ? ? ? 01"
            },
            "AddFrags": {
                "required": false,
                "pattern": "83 C4 10 85 C0 74 ?? 8B 08",
                "lowest": "0x450000",
                "highest": 5636096
            }
        }"#;

        let gd = Gamedata::load_from_str(json).unwrap();
        assert_eq!(gd.len(), 2);
        assert_eq!(gd.names().collect::<Vec<_>>(), vec!["AddFrags", "Tick"]);

        let tick = gd.signature("Tick").unwrap();
        assert!(tick.is_required());
        assert_eq!(tick.pattern().len(), 19);
        assert_eq!(tick.lowest(), None);

        let frags = gd.signature("AddFrags").unwrap();
        assert!(!frags.is_required());
        assert_eq!(frags.lowest(), Some(Address::new(0x45_0000)));
        assert_eq!(frags.highest(), Some(Address::new(0x56_0000)));
    }

    #[test]
    fn test_required_defaults_to_true() {
        let gd = Gamedata::load_from_str(r#"{ "A": { "pattern": "90 C3" } }"#).unwrap();
        assert!(gd.signature("A").unwrap().is_required());
    }

    #[test]
    fn test_bad_entries() {
        assert!(matches!(
            Gamedata::load_from_str(r#"{ "A": { "pattern": "?? ??" } }"#),
            Err(GamedataError::InvalidSignature { .. })
        ));
        assert!(matches!(
            Gamedata::load_from_str(r#"{ "A": { "pattern": "90", "lowest": "0xZZ" } }"#),
            Err(GamedataError::InvalidAddress { .. })
        ));
        assert!(matches!(
            Gamedata::load_from_str(r#"{ "A": { "required": true } }"#),
            Err(GamedataError::ParseError(_))
        ));

        let gd = Gamedata::load_from_str("{}").unwrap();
        assert!(matches!(
            gd.signature("Missing"),
            Err(GamedataError::SignatureNotFound(_))
        ));
    }
}
