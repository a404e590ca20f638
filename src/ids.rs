//! Identifier minting for persisted records
//!
//! Every record family gets its own human-readable prefix so an id string
//! is self-describing when it shows up in logs or exported DTOs.

use bech32::Bech32m;
use uuid7::uuid7;

/// Prefix for change request records.
pub const REQUEST_HRP: &str = "chr";
/// Prefix for change request attribute records.
pub const ATTRIBUTE_HRP: &str = "atr";
/// Prefix for widget instances.
pub const WIDGET_HRP: &str = "wgt";
/// Prefix for component instances.
pub const COMPONENT_HRP: &str = "cmp";
/// Prefix for category lookup records.
pub const CATEGORY_HRP: &str = "cat";
/// Prefix for verification snapshots.
pub const VERIFICATION_HRP: &str = "vrf";

// mint a fresh uuid7 and render it bech32 under the given prefix
pub fn new_id(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encoded = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_id(REQUEST_HRP).unwrap();
        let b = new_id(REQUEST_HRP).unwrap();

        assert!(a.starts_with("chr1"));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(new_id("").is_err());
    }
}
