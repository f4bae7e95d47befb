//! # Telephony Adapter Module
//!
//! Inbound boundary of the cellular engine: tagged radio-cell variants as
//! delivered by the platform telephony layer, serving-cell selection, network
//! generation inference, and the display-override handling for NSA 5G.

use serde::{Deserialize, Serialize};

/// One cell snapshot as consumed by the analysis pipeline. Immutable once
/// built; history rings hold clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub timestamp_ms: i64,
    /// 64-bit to hold 5G NR NCI values.
    pub cell_id: Option<i64>,
    /// 2G/3G location area code.
    pub lac: Option<i32>,
    /// 4G/5G tracking area code.
    pub tac: Option<i32>,
    pub mcc: Option<String>,
    pub mnc: Option<String>,
    pub signal_dbm: i32,
    pub network_type: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl CellSnapshot {
    /// Operator key for same-carrier comparisons ("mcc-mnc" when both known).
    pub fn operator_key(&self) -> Option<String> {
        match (&self.mcc, &self.mnc) {
            (Some(mcc), Some(mnc)) => Some(format!("{mcc}-{mnc}")),
            _ => None,
        }
    }

    pub fn generation(&self) -> NetworkGeneration {
        NetworkGeneration::from_network_type(&self.network_type)
    }
}

/// Network generation inferred from the platform technology tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NetworkGeneration {
    Unknown,
    TwoG,
    ThreeG,
    FourG,
    FiveG,
}

impl NetworkGeneration {
    pub fn from_network_type(network_type: &str) -> Self {
        match network_type.to_ascii_uppercase().as_str() {
            "GPRS" | "EDGE" | "CDMA" | "1XRTT" | "IDEN" | "GSM" => NetworkGeneration::TwoG,
            "UMTS" | "EVDO_0" | "EVDO_A" | "EVDO_B" | "HSDPA" | "HSUPA" | "HSPA" | "HSPAP"
            | "HSPA+" | "EHRPD" | "TD_SCDMA" | "TD-SCDMA" | "WCDMA" => NetworkGeneration::ThreeG,
            "LTE" | "IWLAN" => NetworkGeneration::FourG,
            "NR" => NetworkGeneration::FiveG,
            _ => NetworkGeneration::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NetworkGeneration::TwoG => "2G",
            NetworkGeneration::ThreeG => "3G",
            NetworkGeneration::FourG => "4G",
            NetworkGeneration::FiveG => "5G",
            NetworkGeneration::Unknown => "Unknown",
        }
    }

    /// Numeric rank used for downgrade-chain monotonicity checks. Unknown
    /// maps to 0.
    pub fn rank(&self) -> u8 {
        match self {
            NetworkGeneration::TwoG => 2,
            NetworkGeneration::ThreeG => 3,
            NetworkGeneration::FourG => 4,
            NetworkGeneration::FiveG => 5,
            NetworkGeneration::Unknown => 0,
        }
    }

    pub fn encryption(&self) -> EncryptionStrength {
        match self {
            NetworkGeneration::FiveG | NetworkGeneration::FourG => EncryptionStrength::Strong,
            NetworkGeneration::ThreeG => EncryptionStrength::Moderate,
            NetworkGeneration::TwoG => EncryptionStrength::Weak,
            NetworkGeneration::Unknown => EncryptionStrength::None,
        }
    }
}

/// Effective over-the-air encryption class per generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionStrength {
    Strong,
    Moderate,
    Weak,
    None,
}

impl EncryptionStrength {
    pub fn is_weak_or_none(&self) -> bool {
        matches!(self, EncryptionStrength::Weak | EncryptionStrength::None)
    }
}

/// Cell identity per radio access technology, as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RadioCellIdentity {
    Lte { ci: Option<i64>, tac: Option<i32> },
    Gsm { cid: Option<i64>, lac: Option<i32> },
    Wcdma { cid: Option<i64>, lac: Option<i32> },
    Cdma { bid: Option<i64> },
    Nr { nci: Option<i64>, tac: Option<i32> },
}

/// One entry of the platform's cell-info list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioCell {
    pub registered: bool,
    pub identity: RadioCellIdentity,
    pub mcc: Option<String>,
    pub mnc: Option<String>,
    pub signal_dbm: i32,
}

impl RadioCell {
    pub fn is_nr(&self) -> bool {
        matches!(self.identity, RadioCellIdentity::Nr { .. })
    }

    pub fn technology(&self) -> &'static str {
        match self.identity {
            RadioCellIdentity::Lte { .. } => "LTE",
            RadioCellIdentity::Gsm { .. } => "GSM",
            RadioCellIdentity::Wcdma { .. } => "WCDMA",
            RadioCellIdentity::Cdma { .. } => "CDMA",
            RadioCellIdentity::Nr { .. } => "NR",
        }
    }

    pub fn cell_id(&self) -> Option<i64> {
        match self.identity {
            RadioCellIdentity::Lte { ci, .. } => ci,
            RadioCellIdentity::Gsm { cid, .. } => cid,
            RadioCellIdentity::Wcdma { cid, .. } => cid,
            RadioCellIdentity::Cdma { bid } => bid,
            RadioCellIdentity::Nr { nci, .. } => nci,
        }
    }

    pub fn lac(&self) -> Option<i32> {
        match self.identity {
            RadioCellIdentity::Gsm { lac, .. } | RadioCellIdentity::Wcdma { lac, .. } => lac,
            _ => None,
        }
    }

    pub fn tac(&self) -> Option<i32> {
        match self.identity {
            RadioCellIdentity::Lte { tac, .. } | RadioCellIdentity::Nr { tac, .. } => tac,
            _ => None,
        }
    }
}

/// Prefer the first registered NR cell, else the first registered cell.
pub fn select_serving_cell(cells: &[RadioCell]) -> Option<&RadioCell> {
    cells
        .iter()
        .find(|c| c.registered && c.is_nr())
        .or_else(|| cells.iter().find(|c| c.registered))
}

/// Build a snapshot from the selected serving cell.
pub fn snapshot_from_cell(
    cell: &RadioCell,
    timestamp_ms: i64,
    location: Option<(f64, f64)>,
) -> CellSnapshot {
    CellSnapshot {
        timestamp_ms,
        cell_id: cell.cell_id(),
        lac: cell.lac(),
        tac: cell.tac(),
        mcc: cell.mcc.clone(),
        mnc: cell.mnc.clone(),
        signal_dbm: cell.signal_dbm,
        network_type: cell.technology().to_string(),
        latitude: location.map(|l| l.0),
        longitude: location.map(|l| l.1),
    }
}

/// Display-configuration override reported by the platform for NSA 5G, where
/// the anchor cell is LTE but the data path is NR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayOverride {
    None,
    LteCa,
    LteAdvancedPro,
    NrNsa,
    NrNsaMmwave,
    NrAdvanced,
}

impl DisplayOverride {
    pub fn implies_5g(&self) -> bool {
        matches!(
            self,
            DisplayOverride::NrNsa | DisplayOverride::NrNsaMmwave | DisplayOverride::NrAdvanced
        )
    }
}

/// Generation shown to the user: NSA overrides promote an LTE anchor to 5G.
/// Anomaly analysis keeps using the raw snapshot generation.
pub fn effective_display_generation(
    raw: NetworkGeneration,
    display_override: DisplayOverride,
) -> NetworkGeneration {
    if raw == NetworkGeneration::FourG && display_override.implies_5g() {
        NetworkGeneration::FiveG
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lte_cell(registered: bool, ci: i64) -> RadioCell {
        RadioCell {
            registered,
            identity: RadioCellIdentity::Lte {
                ci: Some(ci),
                tac: Some(1234),
            },
            mcc: Some("310".to_string()),
            mnc: Some("260".to_string()),
            signal_dbm: -95,
        }
    }

    fn nr_cell(registered: bool, nci: i64) -> RadioCell {
        RadioCell {
            registered,
            identity: RadioCellIdentity::Nr {
                nci: Some(nci),
                tac: Some(9876),
            },
            mcc: Some("310".to_string()),
            mnc: Some("260".to_string()),
            signal_dbm: -80,
        }
    }

    #[test]
    fn test_generation_inference_table() {
        for tag in ["GPRS", "EDGE", "CDMA", "1xRTT", "iDEN", "GSM"] {
            assert_eq!(NetworkGeneration::from_network_type(tag), NetworkGeneration::TwoG);
        }
        for tag in ["UMTS", "EVDO_0", "HSDPA", "HSUPA", "HSPA", "HSPAP", "EHRPD", "TD_SCDMA"] {
            assert_eq!(NetworkGeneration::from_network_type(tag), NetworkGeneration::ThreeG);
        }
        assert_eq!(NetworkGeneration::from_network_type("LTE"), NetworkGeneration::FourG);
        assert_eq!(NetworkGeneration::from_network_type("IWLAN"), NetworkGeneration::FourG);
        assert_eq!(NetworkGeneration::from_network_type("NR"), NetworkGeneration::FiveG);
        assert_eq!(
            NetworkGeneration::from_network_type("SOMETHING_NEW"),
            NetworkGeneration::Unknown
        );
    }

    #[test]
    fn test_generation_rank_domain() {
        for tag in ["GSM", "UMTS", "LTE", "NR", "bogus"] {
            let rank = NetworkGeneration::from_network_type(tag).rank();
            assert!(matches!(rank, 0 | 2 | 3 | 4 | 5));
        }
    }

    #[test]
    fn test_encryption_by_generation() {
        assert!(!NetworkGeneration::FiveG.encryption().is_weak_or_none());
        assert!(!NetworkGeneration::ThreeG.encryption().is_weak_or_none());
        assert!(NetworkGeneration::TwoG.encryption().is_weak_or_none());
        assert!(NetworkGeneration::Unknown.encryption().is_weak_or_none());
    }

    #[test]
    fn test_serving_cell_prefers_registered_nr() {
        let cells = vec![lte_cell(true, 100), nr_cell(true, 200), nr_cell(false, 300)];
        let selected = select_serving_cell(&cells).unwrap();
        assert_eq!(selected.cell_id(), Some(200));

        let lte_only = vec![nr_cell(false, 1), lte_cell(true, 2)];
        assert_eq!(select_serving_cell(&lte_only).unwrap().cell_id(), Some(2));

        let none_registered = vec![nr_cell(false, 1), lte_cell(false, 2)];
        assert!(select_serving_cell(&none_registered).is_none());
    }

    #[test]
    fn test_snapshot_from_nr_cell_uses_nci_and_tac() {
        let cell = nr_cell(true, 0x12_3456_7890);
        let snap = snapshot_from_cell(&cell, 1_000, Some((40.0, -74.0)));
        assert_eq!(snap.cell_id, Some(0x12_3456_7890));
        assert_eq!(snap.tac, Some(9876));
        assert_eq!(snap.lac, None);
        assert_eq!(snap.network_type, "NR");
        assert_eq!(snap.operator_key().as_deref(), Some("310-260"));
    }

    #[test]
    fn test_display_override_promotes_lte_only() {
        assert_eq!(
            effective_display_generation(NetworkGeneration::FourG, DisplayOverride::NrNsa),
            NetworkGeneration::FiveG
        );
        assert_eq!(
            effective_display_generation(NetworkGeneration::FourG, DisplayOverride::LteCa),
            NetworkGeneration::FourG
        );
        assert_eq!(
            effective_display_generation(NetworkGeneration::ThreeG, DisplayOverride::NrAdvanced),
            NetworkGeneration::ThreeG
        );
    }
}
