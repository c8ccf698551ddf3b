//! Asset Registry (C2): native/standard asset-code mapping and tradable-pair
//! resolution against the configured target fiat.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::exchange::PairInfo;

/// A small, fixed table of well-known native/standard code exceptions.
/// Anything not listed here round-trips through the identity mapping, which
/// covers the common case where Kraken's native code already equals the
/// standard ticker (e.g. `ETH`, `SOL`).
const NATIVE_TO_STANDARD: &[(&str, &str)] = &[
    ("XXBT", "BTC"),
    ("XBT", "BTC"),
    ("XETH", "ETH"),
    ("XXDG", "DOGE"),
    ("XDG", "DOGE"),
    ("XXRP", "XRP"),
    ("XLTC", "LTC"),
    ("ZUSD", "USD"),
    ("ZEUR", "EUR"),
    ("ZGBP", "GBP"),
    ("ZCAD", "CAD"),
    ("ZJPY", "JPY"),
];

/// A small hard-coded floor used only when the catalog lookup misses
/// entirely (e.g. a pair was delisted mid-session). The catalog value from
/// `list_pairs()` always takes precedence over this table.
const FALLBACK_MINIMUMS: &[(&str, &str)] = &[
    ("BTC", "0.0001"),
    ("ETH", "0.001"),
    ("DOGE", "10"),
    ("XRP", "1"),
    ("LTC", "0.01"),
];

const GENERIC_FLOOR: &str = "0.00000001";

pub struct AssetRegistry {
    native_to_standard: HashMap<String, String>,
    standard_to_native: HashMap<String, String>,
    /// standard base asset -> pair info, resolved against `target_fiat` at load time.
    pairs: HashMap<String, PairInfo>,
    target_fiat_standard: String,
}

impl AssetRegistry {
    /// Loads the catalog once via C1 and builds the standard<->native table
    /// plus the base-asset -> pair index for the configured target fiat.
    pub fn load(pairs: Vec<PairInfo>, target_fiat: &str) -> Self {
        let mut native_to_standard = HashMap::new();
        let mut standard_to_native = HashMap::new();
        for (native, standard) in NATIVE_TO_STANDARD {
            native_to_standard.insert(native.to_string(), standard.to_string());
            standard_to_native.insert(standard.to_string(), native.to_string());
        }

        let target_fiat_standard = Self::standardize_with(&native_to_standard, target_fiat);

        let target_native = Self::nativize_with(&standard_to_native, &target_fiat_standard);

        let mut by_base: HashMap<String, PairInfo> = HashMap::new();
        for pair in pairs {
            if pair.quote == target_native || Self::standardize_with(&native_to_standard, &pair.quote) == target_fiat_standard {
                let base_standard = Self::standardize_with(&native_to_standard, &pair.base);
                // First hit wins: if an asset is listed under more than one
                // symbol convention (e.g. XBT/BTC), keep whichever pair we
                // encountered first rather than overwriting it.
                by_base.entry(base_standard).or_insert(pair);
            }
        }

        Self {
            native_to_standard,
            standard_to_native,
            pairs: by_base,
            target_fiat_standard,
        }
    }

    pub fn standardize(&self, native: &str) -> String {
        Self::standardize_with(&self.native_to_standard, native)
    }

    pub fn nativize(&self, standard: &str) -> String {
        Self::nativize_with(&self.standard_to_native, standard)
    }

    fn standardize_with(table: &HashMap<String, String>, native: &str) -> String {
        table.get(native).cloned().unwrap_or_else(|| native.to_string())
    }

    fn nativize_with(table: &HashMap<String, String>, standard: &str) -> String {
        table.get(standard).cloned().unwrap_or_else(|| standard.to_string())
    }

    pub fn is_target_fiat(&self, asset: &str) -> bool {
        let standard = self.standardize(asset);
        standard == self.target_fiat_standard
    }

    /// Resolves the pair symbol and minimum order size for selling
    /// `standard_asset` into the configured target fiat.
    pub fn pair_for(&self, standard_asset: &str) -> Option<(String, Decimal)> {
        self.pairs
            .get(standard_asset)
            .map(|p| (p.pair_symbol.clone(), p.minimum_order_size))
    }

    /// Fallback cascade used when the live catalog has no entry: small
    /// hard-coded per-asset table, else a generic floor. The catalog
    /// (`pair_for`) is always checked first by callers.
    pub fn minimum_order_size(&self, standard_asset: &str) -> Decimal {
        if let Some((_, min)) = self.pair_for(standard_asset) {
            return min;
        }
        FALLBACK_MINIMUMS
            .iter()
            .find(|(asset, _)| *asset == standard_asset)
            .map(|(_, min)| min.parse().expect("fallback minimum is a valid decimal literal"))
            .unwrap_or_else(|| GENERIC_FLOOR.parse().expect("generic floor is a valid decimal literal"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pairs() -> Vec<PairInfo> {
        vec![
            PairInfo {
                base: "XXBT".into(),
                quote: "ZUSD".into(),
                pair_symbol: "XBTUSD".into(),
                minimum_order_size: "0.0001".parse().unwrap(),
            },
            PairInfo {
                base: "XETH".into(),
                quote: "ZUSD".into(),
                pair_symbol: "ETHUSD".into(),
                minimum_order_size: "0.001".parse().unwrap(),
            },
            PairInfo {
                base: "XXDG".into(),
                quote: "ZEUR".into(),
                pair_symbol: "XDGEUR".into(),
                minimum_order_size: "10".parse().unwrap(),
            },
        ]
    }

    #[test]
    fn standardize_and_nativize_round_trip() {
        let registry = AssetRegistry::load(sample_pairs(), "ZUSD");
        for standard in ["BTC", "ETH", "DOGE", "XRP", "USD"] {
            let native = registry.nativize(standard);
            assert_eq!(registry.standardize(&native), standard, "round trip failed for {standard}");
        }
        for native in ["XXBT", "XETH", "XXDG", "ZUSD"] {
            let standard = registry.standardize(native);
            assert_eq!(registry.nativize(&standard), native, "round trip failed for {native}");
        }
    }

    #[test]
    fn unknown_codes_fall_back_to_identity() {
        let registry = AssetRegistry::load(sample_pairs(), "ZUSD");
        assert_eq!(registry.standardize("SOL"), "SOL");
        assert_eq!(registry.nativize("SOL"), "SOL");
    }

    #[test]
    fn pair_for_resolves_against_target_fiat() {
        let registry = AssetRegistry::load(sample_pairs(), "ZUSD");
        let (symbol, min) = registry.pair_for("BTC").expect("BTC/USD pair should resolve");
        assert_eq!(symbol, "XBTUSD");
        assert_eq!(min, "0.0001".parse().unwrap());
    }

    #[test]
    fn pair_for_is_none_when_no_market_to_target_fiat() {
        let registry = AssetRegistry::load(sample_pairs(), "ZUSD");
        // DOGE is only listed against EUR in this sample catalog, not USD.
        assert!(registry.pair_for("DOGE").is_none());
    }

    #[test]
    fn target_fiat_is_never_a_sell_candidate() {
        let registry = AssetRegistry::load(sample_pairs(), "ZUSD");
        assert!(registry.is_target_fiat("USD"));
        assert!(registry.is_target_fiat("ZUSD"));
        assert!(!registry.is_target_fiat("BTC"));
    }

    #[test]
    fn minimum_order_size_falls_back_when_catalog_misses() {
        let registry = AssetRegistry::load(sample_pairs(), "ZUSD");
        // DOGE has no USD pair in the catalog; fallback table applies.
        assert_eq!(registry.minimum_order_size("DOGE"), "10".parse().unwrap());
        // A totally unknown asset falls through to the generic floor.
        assert_eq!(registry.minimum_order_size("ZZZ"), GENERIC_FLOOR.parse().unwrap());
    }
}
