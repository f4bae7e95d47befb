//! # Signature Catalog Module
//!
//! Process-wide read-only tables of known attacker and tracker signatures:
//! ITU test-network MCC/MNC ranges, recognized US carrier MNCs, StingRay-typical
//! LAC/TAC values, suspicious cell-id patterns, and the known ultrasonic beacon
//! signature table with vendor and modulation metadata.

use serde::{Deserialize, Serialize};

/// ITU test ranges and reserved codes commonly abused by cell-site simulators.
/// Covers 001-*, 999-*, 000-*, 002-01/02 and 901-01/18.
pub fn is_suspicious_mcc_mnc(mcc: &str, mnc: &str) -> bool {
    match mcc {
        "001" | "999" | "000" => true,
        "002" => matches!(mnc, "01" | "02"),
        "901" => matches!(mnc, "01" | "18"),
        _ => false,
    }
}

/// Recognized US carrier MNCs under MCC 310/311. An unrecognized MNC under
/// these MCCs is a strong simulator indicator.
pub fn is_known_us_carrier_mnc(mcc: &str, mnc: &str) -> bool {
    match mcc {
        "310" => KNOWN_MNC_310.contains(&mnc),
        "311" => KNOWN_MNC_311.contains(&mnc),
        _ => false,
    }
}

static KNOWN_MNC_310: &[&str] = &[
    "004", "005", "006", "010", "012", "013", "020", "030", "070", "090", "120", "150", "160",
    "170", "200", "210", "220", "230", "240", "250", "260", "270", "280", "290", "300", "310",
    "320", "330", "370", "380", "390", "400", "410", "420", "430", "450", "480", "490", "530",
    "560", "590", "640", "650", "660", "680", "770", "800", "830", "850", "880", "890", "900",
    "950", "990",
];

static KNOWN_MNC_311: &[&str] = &[
    "012", "110", "180", "190", "220", "270", "271", "272", "273", "274", "275", "276", "277",
    "278", "279", "280", "281", "282", "283", "284", "285", "286", "287", "288", "289", "390",
    "480", "481", "482", "483", "484", "485", "486", "487", "488", "489", "490", "660", "882",
];

/// Carriers known for aggressive 5G handoff behavior (T-Mobile / Metro /
/// legacy Sprint family). Benign rapid 5G<->5G handoffs on these networks are
/// suppressed below the scoring threshold.
pub fn is_aggressive_handoff_carrier(mcc: &str, mnc: &str) -> bool {
    match mcc {
        "310" => matches!(
            mnc,
            "160" | "200" | "210" | "220" | "230" | "240" | "250" | "260" | "270" | "310" | "490"
                | "660" | "800"
        ),
        "311" => matches!(mnc, "490" | "660" | "882"),
        "312" => matches!(mnc, "190" | "250" | "530"),
        _ => false,
    }
}

/// StingRay deployments frequently announce very low location area codes.
pub fn suspicious_lac(lac: i32) -> bool {
    (0..=10).contains(&lac)
}

/// 4G/5G analogue of [`suspicious_lac`].
pub fn suspicious_tac(tac: i32) -> bool {
    (0..=5).contains(&tac)
}

/// Heuristic match against cell-id values typical of simulator defaults:
/// tiny ids, round numbers, repeated digits, or sequential digit runs.
pub fn is_suspicious_cell_id_pattern(cell_id: i64) -> bool {
    if (1..=100).contains(&cell_id) {
        return true;
    }
    if cell_id > 0 && cell_id % 10_000 == 0 {
        return true;
    }
    if cell_id > 0 && cell_id % 1_000 == 0 && cell_id < 100_000 {
        return true;
    }
    let digits: Vec<u8> = cell_id
        .abs()
        .to_string()
        .bytes()
        .map(|b| b - b'0')
        .collect();
    if digits.len() >= 4 && digits.iter().all(|&d| d == digits[0]) {
        return true;
    }
    if digits.len() >= 5 {
        let ascending = digits.windows(2).all(|w| w[1] == w[0] + 1);
        let descending = digits.windows(2).all(|w| w[0] == w[1] + 1);
        if ascending || descending {
            return true;
        }
    }
    false
}

/// Modulation scheme a beacon vendor is known to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedModulation {
    Fsk,
    Psk,
    Chirp,
    Steady,
    Unknown,
}

/// What a known beacon family is deployed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconPurpose {
    AdTracking,
    TvAttribution,
    CrossDeviceLinking,
    RetailAnalytics,
    LocationVerification,
    PresenceDetection,
    TvViewershipAcr,
    Unknown,
}

impl BeaconPurpose {
    /// Base attribution confidence when a beacon matches a signature with
    /// this purpose.
    pub fn base_confidence(&self) -> u8 {
        match self {
            BeaconPurpose::AdTracking => 90,
            BeaconPurpose::TvAttribution => 85,
            BeaconPurpose::CrossDeviceLinking => 90,
            BeaconPurpose::RetailAnalytics => 75,
            BeaconPurpose::LocationVerification => 70,
            BeaconPurpose::PresenceDetection => 65,
            _ => 60,
        }
    }
}

/// A known ultrasonic beacon deployment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UltrasonicSignature {
    pub center_freq_hz: f32,
    pub vendor: &'static str,
    pub purpose: BeaconPurpose,
    pub expected_modulation: ExpectedModulation,
    /// How a user can confirm the attribution.
    pub confirmation_text: &'static str,
    /// What a user can do about it.
    pub mitigation_text: &'static str,
}

static ULTRASONIC_SIGNATURES: &[UltrasonicSignature] = &[
    UltrasonicSignature {
        center_freq_hz: 18_000.0,
        vendor: "SilverPush",
        purpose: BeaconPurpose::AdTracking,
        expected_modulation: ExpectedModulation::Fsk,
        confirmation_text: "Check whether a nearby TV or radio is playing ad content; the tone \
                            stops when the ad break ends",
        mitigation_text: "Revoke microphone permission from ad-supported apps; mute nearby \
                          media devices",
    },
    UltrasonicSignature {
        center_freq_hz: 17_700.0,
        vendor: "Zapr",
        purpose: BeaconPurpose::TvAttribution,
        expected_modulation: ExpectedModulation::Fsk,
        confirmation_text: "Tone correlates with broadcast TV in the room",
        mitigation_text: "Audit apps with background microphone access",
    },
    UltrasonicSignature {
        center_freq_hz: 18_500.0,
        vendor: "Google Nearby",
        purpose: BeaconPurpose::PresenceDetection,
        expected_modulation: ExpectedModulation::Fsk,
        confirmation_text: "Appears while a Nearby-enabled device is pairing or sharing",
        mitigation_text: "Disable Nearby sharing on devices you control",
    },
    UltrasonicSignature {
        center_freq_hz: 17_800.0,
        vendor: "Chromecast Guest Mode",
        purpose: BeaconPurpose::PresenceDetection,
        expected_modulation: ExpectedModulation::Fsk,
        confirmation_text: "A Chromecast with guest mode enabled is on the local network",
        mitigation_text: "Turn off guest mode on the Chromecast",
    },
    UltrasonicSignature {
        center_freq_hz: 18_900.0,
        vendor: "Signal360",
        purpose: BeaconPurpose::LocationVerification,
        expected_modulation: ExpectedModulation::Psk,
        confirmation_text: "Typically deployed at event venues and stadiums",
        mitigation_text: "Revoke microphone permission from venue or loyalty apps",
    },
    UltrasonicSignature {
        center_freq_hz: 19_150.0,
        vendor: "LISNR",
        purpose: BeaconPurpose::CrossDeviceLinking,
        expected_modulation: ExpectedModulation::Psk,
        confirmation_text: "Persists across rooms and correlates with a specific retail or \
                            payment app being installed",
        mitigation_text: "Uninstall or restrict the app embedding the LISNR SDK",
    },
    UltrasonicSignature {
        center_freq_hz: 20_250.0,
        vendor: "Shopkick",
        purpose: BeaconPurpose::RetailAnalytics,
        expected_modulation: ExpectedModulation::Steady,
        confirmation_text: "Only present inside participating retail stores, near entrances",
        mitigation_text: "Close or uninstall the Shopkick app; the transmitter is store-owned",
    },
    UltrasonicSignature {
        center_freq_hz: 20_600.0,
        vendor: "Alphonso",
        purpose: BeaconPurpose::TvViewershipAcr,
        expected_modulation: ExpectedModulation::Chirp,
        confirmation_text: "Emitted by smart TVs running Alphonso ACR during programming",
        mitigation_text: "Disable ACR / viewing-data collection in the TV settings",
    },
    UltrasonicSignature {
        center_freq_hz: 21_100.0,
        vendor: "Samba TV",
        purpose: BeaconPurpose::TvViewershipAcr,
        expected_modulation: ExpectedModulation::Chirp,
        confirmation_text: "Emitted by smart TVs with Samba interactive features enabled",
        mitigation_text: "Opt out of Samba TV in the smart-TV privacy settings",
    },
];

/// The full ultrasonic signature table.
pub fn ultrasonic_signatures() -> &'static [UltrasonicSignature] {
    ULTRASONIC_SIGNATURES
}

/// Nearest signature within `tolerance_hz` of `freq_hz`, if any.
pub fn find_ultrasonic(freq_hz: f32, tolerance_hz: f32) -> Option<&'static UltrasonicSignature> {
    ULTRASONIC_SIGNATURES
        .iter()
        .filter(|sig| (sig.center_freq_hz - freq_hz).abs() <= tolerance_hz)
        .min_by(|a, b| {
            let da = (a.center_freq_hz - freq_hz).abs();
            let db = (b.center_freq_hz - freq_hz).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_network_codes_are_suspicious() {
        assert!(is_suspicious_mcc_mnc("001", "01"));
        assert!(is_suspicious_mcc_mnc("999", "99"));
        assert!(is_suspicious_mcc_mnc("000", "00"));
        assert!(is_suspicious_mcc_mnc("002", "01"));
        assert!(is_suspicious_mcc_mnc("901", "18"));
        assert!(!is_suspicious_mcc_mnc("002", "03"));
        assert!(!is_suspicious_mcc_mnc("310", "260"));
    }

    #[test]
    fn test_us_carrier_mnc_lookup() {
        assert!(is_known_us_carrier_mnc("310", "260"));
        assert!(is_known_us_carrier_mnc("311", "480"));
        assert!(!is_known_us_carrier_mnc("310", "999"));
        assert!(!is_known_us_carrier_mnc("262", "01"));
    }

    #[test]
    fn test_low_lac_tac_ranges() {
        assert!(suspicious_lac(0));
        assert!(suspicious_lac(1));
        assert!(suspicious_lac(10));
        assert!(!suspicious_lac(11));
        assert!(suspicious_tac(5));
        assert!(!suspicious_tac(6));
    }

    #[test]
    fn test_cell_id_patterns() {
        assert!(is_suspicious_cell_id_pattern(1));
        assert!(is_suspicious_cell_id_pattern(100));
        assert!(!is_suspicious_cell_id_pattern(101));
        assert!(is_suspicious_cell_id_pattern(50_000)); // % 10_000
        assert!(is_suspicious_cell_id_pattern(7_000)); // % 1_000 below 100_000
        assert!(!is_suspicious_cell_id_pattern(107_000)); // % 1_000 but too large
        assert!(is_suspicious_cell_id_pattern(7777)); // repeated digits
        assert!(is_suspicious_cell_id_pattern(12_345)); // ascending run
        assert!(is_suspicious_cell_id_pattern(98_765)); // descending run
        assert!(!is_suspicious_cell_id_pattern(84_213_907));
    }

    #[test]
    fn test_find_ultrasonic_nearest_match() {
        let sig = find_ultrasonic(18_050.0, 100.0).unwrap();
        assert_eq!(sig.vendor, "SilverPush");
        assert_eq!(sig.purpose, BeaconPurpose::AdTracking);
        assert!(find_ultrasonic(16_000.0, 100.0).is_none());
        // between SilverPush and Google Nearby, outside tolerance of both
        assert!(find_ultrasonic(18_250.0, 100.0).is_none());
    }

    #[test]
    fn test_purpose_base_confidence() {
        assert_eq!(BeaconPurpose::AdTracking.base_confidence(), 90);
        assert_eq!(BeaconPurpose::CrossDeviceLinking.base_confidence(), 90);
        assert_eq!(BeaconPurpose::TvAttribution.base_confidence(), 85);
        assert_eq!(BeaconPurpose::RetailAnalytics.base_confidence(), 75);
        assert_eq!(BeaconPurpose::Unknown.base_confidence(), 60);
    }

    #[test]
    fn test_aggressive_handoff_family() {
        assert!(is_aggressive_handoff_carrier("310", "260"));
        assert!(is_aggressive_handoff_carrier("312", "530"));
        assert!(!is_aggressive_handoff_carrier("310", "410"));
    }
}
