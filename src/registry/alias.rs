//! Device aliases and PCM target connection strings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::RegistryError;

/// Maximum alias length
const MAX_ALIAS_LEN: usize = 64;

/// Stable logical name for an audio destination (e.g. "BT_FOSI")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAlias(String);

impl DeviceAlias {
    /// Validate and wrap an alias name.
    ///
    /// Only `[A-Za-z0-9_-]` is allowed so the alias can be used directly as a
    /// mapping file name.
    pub fn new(name: impl Into<String>) -> Result<Self, RegistryError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_ALIAS_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(name))
        } else {
            Err(RegistryError::InvalidAlias(name))
        }
    }

    /// Alias that follows the most recently paired Bluetooth peer
    pub fn default_peer() -> Self {
        Self("BT_PEER".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceAlias {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeviceAlias {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceAlias> for String {
    fn from(alias: DeviceAlias) -> Self {
        alias.0
    }
}

/// Bluetooth device address, normalized to upper-case `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Compact form without separators, used in file names
    pub fn compact(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| RegistryError::Malformed {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(malformed("MAC address needs 6 octets"));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(malformed("MAC octet must be two hex digits"));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| malformed("MAC octet must be two hex digits"))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Bluetooth audio profile exposed by BlueALSA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtProfile {
    A2dp,
    Sco,
}

impl BtProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A2dp => "a2dp",
            Self::Sco => "sco",
        }
    }
}

impl fmt::Display for BtProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BtProfile {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a2dp" => Ok(Self::A2dp),
            "sco" => Ok(Self::Sco),
            _ => Err(RegistryError::Malformed {
                input: s.to_string(),
                reason: "unknown Bluetooth profile".to_string(),
            }),
        }
    }
}

/// Target class, selects the buffer/period pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetClass {
    Hardware,
    Bluetooth,
}

/// ALSA plugin layer used to open a hardware target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwScheme {
    /// Raw device, no format conversion
    Hw,
    /// Device behind the `plug` converter
    #[default]
    PlugHw,
}

impl HwScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hw => "hw",
            Self::PlugHw => "plughw",
        }
    }
}

impl fmt::Display for HwScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete binding for an alias
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PcmTarget {
    /// Physical card (index or id) and device index
    Hardware {
        #[serde(default)]
        scheme: HwScheme,
        card: String,
        device: u32,
    },
    /// BlueALSA endpoint
    Bluetooth { address: MacAddress, profile: BtProfile },
}

impl PcmTarget {
    pub fn class(&self) -> TargetClass {
        match self {
            Self::Hardware { .. } => TargetClass::Hardware,
            Self::Bluetooth { .. } => TargetClass::Bluetooth,
        }
    }

    /// ALSA device name used to open the target
    pub fn alsa_device(&self) -> String {
        match self {
            Self::Hardware {
                scheme,
                card,
                device,
            } => format!("{}:CARD={},DEV={}", scheme, card, device),
            Self::Bluetooth { address, profile } => {
                format!("bluealsa:DEV={},PROFILE={}", address, profile)
            }
        }
    }

    /// Replace a numeric card index with the card's ALSA id
    ///
    /// The id comes from `<asound_root>/card<N>/id`, so `hw:1,0` and
    /// `hw:CARD=<id>,DEV=0` end up with the same device key. Targets whose
    /// card is already an id, or whose index has no card, are unchanged.
    pub fn normalize_card(self, asound_root: &Path) -> Self {
        match self {
            Self::Hardware {
                scheme,
                card,
                device,
            } if !card.is_empty() && card.chars().all(|c| c.is_ascii_digit()) => {
                let id_path = asound_root.join(format!("card{}", card)).join("id");
                let card = match std::fs::read_to_string(&id_path) {
                    Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
                    _ => card,
                };
                Self::Hardware {
                    scheme,
                    card,
                    device,
                }
            }
            other => other,
        }
    }

    /// Stable key identifying the physical device, used by the holder registry
    pub fn device_key(&self) -> String {
        match self {
            Self::Hardware { card, device, .. } => {
                let card: String = card
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                    .collect();
                format!("hw-{}-{}", card, device)
            }
            Self::Bluetooth { address, profile } => {
                format!("bt-{}-{}", address.compact(), profile)
            }
        }
    }
}

impl fmt::Display for PcmTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware {
                scheme,
                card,
                device,
            } => write!(f, "{}:CARD={},DEV={}", scheme, card, device),
            Self::Bluetooth { address, profile } => {
                write!(f, "bluetooth:DEV={},PROFILE={}", address, profile)
            }
        }
    }
}

impl FromStr for PcmTarget {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let malformed = |reason: &str| RegistryError::Malformed {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = input
            .split_once(':')
            .ok_or_else(|| malformed("missing scheme"))?;

        match scheme.to_ascii_lowercase().as_str() {
            "hw" => parse_hardware(HwScheme::Hw, rest).map_err(|r| malformed(&r)),
            "plughw" => parse_hardware(HwScheme::PlugHw, rest).map_err(|r| malformed(&r)),
            "bluetooth" | "bluealsa" => parse_bluetooth(rest).map_err(|r| malformed(&r)),
            _ => Err(malformed("unrecognized scheme")),
        }
    }
}

/// Split `KEY=value,KEY=value` into upper-cased keys, rejecting duplicates
fn parse_pairs(rest: &str) -> Result<Vec<(String, String)>, String> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for field in rest.split(',') {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| format!("expected KEY=value, got {:?}", field))?;
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(format!("empty value for {}", key));
        }
        if pairs.iter().any(|(k, _)| *k == key) {
            return Err(format!("duplicate key {}", key));
        }
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn parse_hardware(scheme: HwScheme, rest: &str) -> Result<PcmTarget, String> {
    if rest.contains('=') {
        let mut card = None;
        let mut device = None;
        for (key, value) in parse_pairs(rest)? {
            match key.as_str() {
                "CARD" => card = Some(value),
                "DEV" => {
                    device = Some(value.parse::<u32>().map_err(|_| "DEV must be a number")?)
                }
                other => return Err(format!("unexpected key {}", other)),
            }
        }
        let card = card.ok_or("missing CARD")?;
        return Ok(PcmTarget::Hardware {
            scheme,
            card,
            device: device.unwrap_or(0),
        });
    }

    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    match fields.as_slice() {
        [card] if !card.is_empty() => Ok(PcmTarget::Hardware {
            scheme,
            card: card.to_string(),
            device: 0,
        }),
        [card, device] if !card.is_empty() => Ok(PcmTarget::Hardware {
            scheme,
            card: card.to_string(),
            device: device
                .parse()
                .map_err(|_| "device index must be a number".to_string())?,
        }),
        _ => Err("expected hw:<card>[,<device>]".to_string()),
    }
}

fn parse_bluetooth(rest: &str) -> Result<PcmTarget, String> {
    let mut address = None;
    let mut profile = None;
    for (key, value) in parse_pairs(rest)? {
        match key.as_str() {
            "DEV" => address = Some(value.parse::<MacAddress>().map_err(|e| e.to_string())?),
            "PROFILE" => profile = Some(value.parse::<BtProfile>().map_err(|e| e.to_string())?),
            other => return Err(format!("unexpected key {}", other)),
        }
    }
    Ok(PcmTarget::Bluetooth {
        address: address.ok_or("missing DEV")?,
        profile: profile.ok_or("missing PROFILE")?,
    })
}
