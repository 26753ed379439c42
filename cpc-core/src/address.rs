use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix for account addresses.
pub const ACCOUNT_PREFIX: &str = "cpc";
/// Prefix for validator consensus addresses.
pub const CONSENSUS_PREFIX: &str = "cpcvalcons";

/// Reserved account that receives the treasury share of fees when the
/// network routes a fraction there instead of burning.
pub const TREASURY_ADDRESS: &str = "cpctreasury";

/// Human-readable account address (`cpc…`), derived from a public key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountAddress(pub String);

/// Human-readable validator consensus address (`cpcvalcons…`). Independent
/// of the operator's account address.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsensusAddress(pub String);

impl AccountAddress {
    pub fn treasury() -> Self {
        Self(TREASURY_ADDRESS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ConsensusAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ConsensusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountAddress({})", self.0)
    }
}

impl fmt::Debug for ConsensusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConsensusAddress({})", self.0)
    }
}
