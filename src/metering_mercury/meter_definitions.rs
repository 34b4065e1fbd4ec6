use super::protocol::{self, Decoder};
use super::structs::{ChannelKey, MeasurementClass, ReadMode};

/* address + payload + CRC */
const SCALED_VALUE_REPLY_LEN: usize = 1 + 3 + 2;
const GROUP_REPLY_LEN: usize = 1 + 16 + 2;
const UINT16_REPLY_LEN: usize = 1 + 2 + 2;

/// One request the meter understands and how to read its reply
#[derive(Debug, Clone, PartialEq)]
pub struct PollTemplate {
    pub class: MeasurementClass,
    /// Request without CRC, address byte is a placeholder
    pub request: Vec<u8>,
    pub decoder: Decoder,
    /// `None` when the reply covers several channels of the class
    pub chan: Option<ChannelKey>,
    /// `None` when the request is used by every read mode
    pub mode: Option<ReadMode>,
    pub reply_len: usize,
}

impl PollTemplate {
    fn applies_to(&self, mode: ReadMode) -> bool {
        self.mode.map_or(true, |m| m == mode)
    }
}

/// All poll templates, built once and shared by every meter
#[derive(Debug, Clone)]
pub struct Catalogue {
    templates: Vec<PollTemplate>,
}

/* Phases each instantaneous measurement exists for, 0 is the sum over all phases */
fn phases(class: MeasurementClass) -> &'static [u8] {
    match class {
        MeasurementClass::Current | MeasurementClass::Voltage => &[1, 2, 3],
        MeasurementClass::Frequency => &[0],
        _ => &[0, 1, 2, 3],
    }
}

const INSTANT_CLASSES: [MeasurementClass; 8] = [
    MeasurementClass::ActivePower,
    MeasurementClass::ReactivePower,
    MeasurementClass::ApparentPower,
    MeasurementClass::Current,
    MeasurementClass::Voltage,
    MeasurementClass::Frequency,
    MeasurementClass::PowerFactor,
    MeasurementClass::Distortion,
];

impl Catalogue {
    pub fn new() -> Self {
        let mut templates = Vec::new();

        for class in INSTANT_CLASSES {
            /* Frequency is a single value, every mode reads it the same way */
            if class == MeasurementClass::Frequency {
                templates.push(PollTemplate {
                    class,
                    request: protocol::instant_value_request(class, 0),
                    decoder: Decoder::ScaledValue,
                    chan: Some(ChannelKey::of_class(class)),
                    mode: None,
                    reply_len: SCALED_VALUE_REPLY_LEN,
                });
                continue;
            }

            for phase in phases(class) {
                templates.push(PollTemplate {
                    class,
                    request: protocol::instant_value_request(class, *phase),
                    decoder: Decoder::ScaledValue,
                    chan: Some(ChannelKey::indexed(class, *phase as usize)),
                    mode: Some(ReadMode::Single),
                    reply_len: SCALED_VALUE_REPLY_LEN,
                });
            }

            templates.push(PollTemplate {
                class,
                request: protocol::instant_array_request(class),
                decoder: Decoder::ScaledValueArray,
                chan: None,
                mode: Some(ReadMode::Array),
                reply_len: GROUP_REPLY_LEN,
            });

            templates.push(PollTemplate {
                class,
                request: protocol::float_group_request(class),
                decoder: Decoder::FloatGroup,
                chan: None,
                mode: Some(ReadMode::Float),
                reply_len: GROUP_REPLY_LEN,
            });
        }

        /* A+, A-, R+, R- since reset in one request */
        templates.push(PollTemplate {
            class: MeasurementClass::Energy,
            request: protocol::energy_request(),
            decoder: Decoder::EnergyTotals,
            chan: None,
            mode: None,
            reply_len: GROUP_REPLY_LEN,
        });

        templates.push(PollTemplate {
            class: MeasurementClass::Temperature,
            request: protocol::temperature_request(),
            decoder: Decoder::Uint16,
            chan: Some(ChannelKey::of_class(MeasurementClass::Temperature)),
            mode: None,
            reply_len: UINT16_REPLY_LEN,
        });

        Catalogue { templates }
    }

    pub fn get(&self, idx: usize) -> Option<&PollTemplate> {
        self.templates.get(idx)
    }

    /// Template answering exactly this channel
    pub fn find_by_key(&self, mode: ReadMode, key: &ChannelKey) -> Option<usize> {
        self.templates
            .iter()
            .position(|t| t.applies_to(mode) && t.chan.as_ref() == Some(key))
    }

    /// Template answering all channels of a class at once
    pub fn find_by_class(&self, mode: ReadMode, class: MeasurementClass) -> Option<usize> {
        self.templates
            .iter()
            .position(|t| t.applies_to(mode) && t.chan.is_none() && t.class == class)
    }
}

impl Default for Catalogue {
    fn default() -> Self {
        Catalogue::new()
    }
}
