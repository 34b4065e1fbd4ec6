use serde::{Deserialize, Serialize};
use std::fmt;

use super::meter_definitions::Catalogue;

/// Level 1 password of a factory fresh meter
pub const DEFAULT_PASSWORD: [u8; 6] = [1, 1, 1, 1, 1, 1];

fn default_kti() -> f64 { 1.0 }
fn default_ktu() -> f64 { 1.0 }
fn default_ks() -> f64 { 1.0 }
fn default_constant() -> f64 { 1250.0 }

/// What a channel measures, derived from the prefix of its key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementClass {
    Energy,
    ActivePower,
    ReactivePower,
    ApparentPower,
    Current,
    Voltage,
    Frequency,
    PowerFactor,
    Distortion,
    Temperature,
}

/* Longest prefixes first, "cos" and "Kuf" would otherwise never match */
const CLASS_PREFIXES: [(&str, MeasurementClass); 10] = [
    ("cos", MeasurementClass::PowerFactor),
    ("Kuf", MeasurementClass::Distortion),
    ("E", MeasurementClass::Energy),
    ("P", MeasurementClass::ActivePower),
    ("Q", MeasurementClass::ReactivePower),
    ("S", MeasurementClass::ApparentPower),
    ("I", MeasurementClass::Current),
    ("U", MeasurementClass::Voltage),
    ("F", MeasurementClass::Frequency),
    ("T", MeasurementClass::Temperature),
];

impl MeasurementClass {
    pub fn from_key(key: &str) -> Option<Self> {
        CLASS_PREFIXES
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix))
            .map(|(_, class)| *class)
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            MeasurementClass::Energy => "E",
            MeasurementClass::ActivePower => "P",
            MeasurementClass::ReactivePower => "Q",
            MeasurementClass::ApparentPower => "S",
            MeasurementClass::Current => "I",
            MeasurementClass::Voltage => "U",
            MeasurementClass::Frequency => "F",
            MeasurementClass::PowerFactor => "cos",
            MeasurementClass::Distortion => "Kuf",
            MeasurementClass::Temperature => "T",
        }
    }

    /// Factor applied to the raw integer of a 3-byte reading
    pub fn scale(&self) -> f64 {
        match self {
            MeasurementClass::ActivePower
            | MeasurementClass::ReactivePower
            | MeasurementClass::ApparentPower
            | MeasurementClass::Voltage
            | MeasurementClass::Frequency
            | MeasurementClass::Distortion => 0.01,
            MeasurementClass::Current | MeasurementClass::PowerFactor => 0.001,
            MeasurementClass::Energy | MeasurementClass::Temperature => 1.0,
        }
    }
}

/// Name of a channel as the sink knows it, e.g. `I1` or `EAP`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(key: impl Into<String>) -> Self {
        ChannelKey(key.into())
    }

    /// Key of one element of a grouped reading, `P` + 2 gives `P2`
    pub fn indexed(class: MeasurementClass, index: usize) -> Self {
        ChannelKey(format!("{}{}", class.prefix(), index))
    }

    pub fn of_class(class: MeasurementClass) -> Self {
        ChannelKey(class.prefix().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn class(&self) -> Option<MeasurementClass> {
        MeasurementClass::from_key(&self.0)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request family used for instantaneous values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// One `08 11` request per phase
    #[default]
    Single,
    /// One `08 14` request per measurement, all phases as 3-byte values
    Array,
    /// One `08 1b 02` request per measurement, all phases as floats
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub kti: f64,
    pub ktu: f64,
    pub ks: f64,
    pub constant: f64,
    /// Energy coefficient (kti * ktu) / (2 * constant)
    pub kt: f64,
}

impl Calibration {
    /// Missing or zero values fall back to the factory defaults
    pub fn new(kti: Option<f64>, ktu: Option<f64>, ks: Option<f64>, constant: Option<f64>) -> Self {
        let pick = |v: Option<f64>, default: fn() -> f64| match v {
            Some(v) if v != 0.0 && v.is_finite() => v,
            _ => default(),
        };

        let kti = pick(kti, default_kti);
        let ktu = pick(ktu, default_ktu);
        let ks = pick(ks, default_ks);
        let constant = pick(constant, default_constant);

        Calibration { kti, ktu, ks, constant, kt: (kti * ktu) / (2.0 * constant) }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::new(None, None, None, None)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: String,
    pub key: ChannelKey,
    pub class: MeasurementClass,
    pub multiplier: u32,
    pub order: i64,
}

/// Channels of one meter in declaration order, unique by key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelMap {
    channels: Vec<Channel>,
}

impl ChannelMap {
    pub fn new() -> Self {
        ChannelMap { channels: Vec::new() }
    }

    /// Returns false and keeps the map untouched if the key is already known
    pub fn insert(&mut self, channel: Channel) -> bool {
        if self.contains(&channel.key) {
            return false;
        }
        self.channels.push(channel);
        true
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &ChannelKey) -> Option<&Channel> {
        self.channels.iter().find(|c| &c.key == key)
    }

    pub fn of_class(&self, class: MeasurementClass) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(move |c| c.class == class)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollPlanEntry {
    /// Index into the poll template catalogue
    pub template: usize,
    pub multiplier: u32,
    /// Sweeps left until the entry is due again
    pub countdown: u32,
}

impl PollPlanEntry {
    pub fn new(template: usize, multiplier: u32) -> Self {
        PollPlanEntry { template, multiplier: multiplier.max(1), countdown: 0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Meter {
    pub address: u8,
    pub name: String,
    pub calibration: Calibration,
    pub password: [u8; 6],
    pub read_mode: ReadMode,
    pub plan: Vec<PollPlanEntry>,
    pub channels: ChannelMap,
    /// Position in `plan`, `None` while the channel still has to be opened
    pub cursor: Option<usize>,
    pub errors: u32,
}

impl Meter {
    /// Template of the request the meter is currently answering, `None` for the auth request
    pub fn current_template(&self) -> Option<usize> {
        self.cursor.and_then(|idx| self.plan.get(idx)).map(|entry| entry.template)
    }

    /// Channels this sweep has not read yet, including the one under the cursor
    pub fn remaining_channels(&self, catalogue: &Catalogue) -> Vec<Channel> {
        let start = self.cursor.unwrap_or(0);
        let mut result = Vec::new();

        for entry in self.plan.iter().skip(start) {
            let template = match catalogue.get(entry.template) {
                Some(t) => t,
                None => continue,
            };

            match &template.chan {
                Some(key) => {
                    if let Some(channel) = self.channels.get(key) {
                        result.push(channel.clone());
                    }
                }
                None => {
                    result.extend(self.channels.of_class(template.class).cloned());
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_from_key() {
        assert_eq!(MeasurementClass::from_key("I1"), Some(MeasurementClass::Current));
        assert_eq!(MeasurementClass::from_key("EAP"), Some(MeasurementClass::Energy));
        assert_eq!(MeasurementClass::from_key("cos2"), Some(MeasurementClass::PowerFactor));
        assert_eq!(MeasurementClass::from_key("Kuf1"), Some(MeasurementClass::Distortion));
        assert_eq!(MeasurementClass::from_key("F"), Some(MeasurementClass::Frequency));
        assert_eq!(MeasurementClass::from_key("X1"), None);
    }

    #[test]
    fn test_calibration_defaults() {
        let c = Calibration::default();
        assert_eq!(c.constant, 1250.0);
        assert!((c.kt - 1.0 / 2500.0).abs() < 1e-12);

        let c = Calibration::new(Some(40.0), Some(100.0), None, Some(5000.0));
        assert!((c.kt - 0.4).abs() < 1e-12);

        let c = Calibration::new(Some(0.0), None, None, Some(0.0));
        assert_eq!(c.kti, 1.0);
        assert_eq!(c.constant, 1250.0);
    }

    #[test]
    fn test_channel_map_rejects_duplicates() {
        let mut map = ChannelMap::new();
        let ch = Channel {
            id: "a".to_string(),
            key: ChannelKey::new("U1"),
            class: MeasurementClass::Voltage,
            multiplier: 1,
            order: 1,
        };
        assert!(map.insert(ch.clone()));
        assert!(!map.insert(Channel { id: "b".to_string(), ..ch }));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&ChannelKey::new("U1")).unwrap().id, "a");
    }

    #[test]
    fn test_indexed_key() {
        assert_eq!(ChannelKey::indexed(MeasurementClass::PowerFactor, 3).as_str(), "cos3");
        assert_eq!(ChannelKey::of_class(MeasurementClass::Temperature).as_str(), "T");
    }
}
