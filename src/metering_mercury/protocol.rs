/*
    Frame layout of the Mercury / SET-4TM exchange protocol:

        [address][command][parameters ...][crc lo][crc hi]

    Requests are kept as templates with a zero address placeholder, `finalize`
    puts the meter address in front and appends the CRC.
*/
use crc16::{State, MODBUS};
use log::debug;
use serde::{Serialize, Serializer};

use super::structs::{Calibration, ChannelKey, MeasurementClass};
use super::{DecodeError, FrameError};

pub const MIN_FRAME_LEN: usize = 4;
pub const CRC_LEN: usize = 2;
/// Length of a status only reply: address, status byte and CRC
pub const STATUS_REPLY_LEN: usize = 4;

pub const CMD_LINK_TEST: u8 = 0x00;
pub const CMD_OPEN_CHANNEL: u8 = 0x01;
pub const CMD_READ_ENERGY: u8 = 0x05;
pub const CMD_READ_PARAMS: u8 = 0x08;

pub const PARAM_SERIAL_NUMBER: u8 = 0x00;
pub const PARAM_TEMPERATURE: u8 = 0x01;
pub const PARAM_COEFFICIENTS: u8 = 0x02;
pub const PARAM_NETWORK_ADDRESS: u8 = 0x05;
pub const PARAM_INSTANT_VALUE: u8 = 0x11;
pub const PARAM_VARIANT: u8 = 0x12;
pub const PARAM_INSTANT_ARRAY: u8 = 0x14;
pub const PARAM_FLOAT_GROUP: u8 = 0x1b;

pub const FLOAT_GROUP_MODE: u8 = 0x02;
pub const ENERGY_SINCE_RESET: u8 = 0x00;
pub const ACCESS_LEVEL_USER: u8 = 0x01;

pub const NO_VALUE_SENTINEL: u32 = 0xFFFF_FFFF;

pub const ENERGY_KEYS: [&str; 4] = ["EAP", "EAM", "ERP", "ERM"];

/// A decoded number, energy registers may report that they hold nothing
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    Value(f64),
    NoValue,
}

/* The sink expects an empty string for registers without a value */
impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Measurement::Value(v) => serializer.serialize_f64(*v),
            Measurement::NoValue => serializer.serialize_str(""),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub chan: ChannelKey,
    pub value: Measurement,
}

impl Reading {
    fn new(chan: ChannelKey, value: Measurement) -> Self {
        Reading { chan, value }
    }
}

/// How the payload of a reply is turned into readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    ScaledValue,
    ScaledValueArray,
    EnergyTotals,
    FloatGroup,
    Uint16,
}

pub fn crc16(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

/// Replace the address byte and append the CRC
pub fn finalize(frame: &[u8], address: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + CRC_LEN);
    out.push(address);
    if frame.len() > 1 {
        out.extend_from_slice(&frame[1..]);
    }
    let crc = crc16(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < CRC_LEN {
        return false;
    }
    let split = frame.len() - CRC_LEN;
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    received == crc16(&frame[..split])
}

/// Same frame with the CRC it should have carried, used for diagnostics
fn with_expected_crc(frame: &[u8]) -> Vec<u8> {
    let split = frame.len().saturating_sub(CRC_LEN);
    let mut out = frame[..split].to_vec();
    let crc = crc16(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Checks length and CRC of a reply
pub fn check_frame(frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { frame: frame.to_vec() });
    }

    if !verify_crc(frame) {
        return Err(FrameError::CrcMismatch {
            received: frame.to_vec(),
            expected: with_expected_crc(frame),
        });
    }
    Ok(())
}

/// A 4 byte reply carries the exchange status, anything but OK is an error
pub fn check_status(frame: &[u8]) -> Result<(), DecodeError> {
    if frame.len() == STATUS_REPLY_LEN && frame[1] != 0x00 {
        return Err(DecodeError::ExchangeStatus {
            address: frame[0],
            code: frame[1],
            text: status_text(frame[1]),
        });
    }
    Ok(())
}

pub fn parse_address(frame: &[u8]) -> Option<u8> {
    frame.first().copied()
}

/// Bytes between the address and the CRC
pub fn payload(frame: &[u8]) -> &[u8] {
    if frame.len() < 1 + CRC_LEN {
        return &[];
    }
    &frame[1..frame.len() - CRC_LEN]
}

pub fn status_text(code: u8) -> String {
    let text = match code {
        0x00 => "OK",
        0x01 => "invalid command or parameter",
        0x02 => "internal meter error",
        0x03 => "insufficient access level",
        0x04 => "internal clock already adjusted today",
        0x05 => "communication channel not open",
        0x06 => "repeat the request within 0.5 s",
        0x07 => "measurement not ready / no data for parameter",
        0x08 => "meter busy",
        _ => return format!("unrecognized status, byte={:x}", code),
    };
    text.to_string()
}

/* Requests */

pub fn auth_request(password: &[u8; 6]) -> Vec<u8> {
    let mut req = vec![0x00, CMD_OPEN_CHANNEL, ACCESS_LEVEL_USER];
    req.extend_from_slice(password);
    req
}

/// Parameter byte of `08 11` and `08 14` reads
pub fn rwri(class: MeasurementClass, phase: u8) -> u8 {
    match class {
        MeasurementClass::ActivePower => phase,
        MeasurementClass::ReactivePower => 0x04 + phase,
        MeasurementClass::ApparentPower => 0x08 + phase,
        MeasurementClass::Voltage => 0x10 + phase,
        MeasurementClass::Current => 0x20 + phase,
        MeasurementClass::PowerFactor => 0x30 + phase,
        MeasurementClass::Frequency => 0x40,
        MeasurementClass::Distortion => 0x80 + phase,
        MeasurementClass::Energy | MeasurementClass::Temperature => 0x00,
    }
}

/// Quantity selector of `08 1b 02` group reads
pub fn float_group_code(class: MeasurementClass) -> u8 {
    match class {
        MeasurementClass::ActivePower => 0x00,
        MeasurementClass::ReactivePower => 0x04,
        MeasurementClass::ApparentPower => 0x08,
        MeasurementClass::Voltage => 0x10,
        MeasurementClass::Current => 0x20,
        MeasurementClass::PowerFactor => 0x30,
        MeasurementClass::Frequency => 0x40,
        MeasurementClass::Distortion => 0x80,
        MeasurementClass::Energy | MeasurementClass::Temperature => 0x00,
    }
}

pub fn instant_value_request(class: MeasurementClass, phase: u8) -> Vec<u8> {
    vec![0x00, CMD_READ_PARAMS, PARAM_INSTANT_VALUE, rwri(class, phase)]
}

pub fn instant_array_request(class: MeasurementClass) -> Vec<u8> {
    vec![0x00, CMD_READ_PARAMS, PARAM_INSTANT_ARRAY, rwri(class, 0)]
}

pub fn float_group_request(class: MeasurementClass) -> Vec<u8> {
    vec![0x00, CMD_READ_PARAMS, PARAM_FLOAT_GROUP, FLOAT_GROUP_MODE, float_group_code(class)]
}

pub fn energy_request() -> Vec<u8> {
    vec![0x00, CMD_READ_ENERGY, ENERGY_SINCE_RESET, 0x00]
}

pub fn temperature_request() -> Vec<u8> {
    vec![0x00, CMD_READ_PARAMS, PARAM_TEMPERATURE]
}

/* Service requests, not part of the poll plan */

pub fn link_test_request() -> Vec<u8> {
    vec![0x00, CMD_LINK_TEST]
}

pub fn network_address_request(long_address: bool) -> Vec<u8> {
    vec![0x00, CMD_READ_PARAMS, PARAM_NETWORK_ADDRESS, long_address as u8]
}

pub fn serial_number_request() -> Vec<u8> {
    vec![0x00, CMD_READ_PARAMS, PARAM_SERIAL_NUMBER]
}

pub fn coefficients_request() -> Vec<u8> {
    vec![0x00, CMD_READ_PARAMS, PARAM_COEFFICIENTS]
}

pub fn variant_request() -> Vec<u8> {
    vec![0x00, CMD_READ_PARAMS, PARAM_VARIANT]
}

/* Decoding */

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn need(payload: &[u8], len: usize, decoder: &'static str) -> Result<(), DecodeError> {
    if payload.len() < len {
        return Err(DecodeError::PayloadTooShort { decoder, len: payload.len(), need: len });
    }
    Ok(())
}

/// Copy of a 4 byte slot with the bytes of each 16 bit word swapped
fn swapped_slot(payload: &[u8], slot: usize) -> [u8; 4] {
    let b = &payload[slot * 4..slot * 4 + 4];
    [b[1], b[0], b[3], b[2]]
}

/* The two high bits of the leading byte carry direction flags, not magnitude */
fn scaled_3byte(bytes: [u8; 3], class: MeasurementClass) -> f64 {
    let raw = u32::from_be_bytes([0x00, bytes[0] & 0x3f, bytes[1], bytes[2]]);
    round3(raw as f64 * class.scale())
}

pub fn decode_scaled_value(payload: &[u8], class: MeasurementClass, chan: &ChannelKey) -> Result<Vec<Reading>, DecodeError> {
    need(payload, 3, "3-byte value")?;
    let value = scaled_3byte([payload[0], payload[1], payload[2]], class);
    Ok(vec![Reading::new(chan.clone(), Measurement::Value(value))])
}

pub fn decode_scaled_value_array(payload: &[u8], class: MeasurementClass) -> Result<Vec<Reading>, DecodeError> {
    need(payload, 16, "3-byte value array")?;
    let readings = (0..4)
        .map(|idx| {
            let mut slot = swapped_slot(payload, idx);
            slot[0] &= 0x3f;
            let raw = u32::from_be_bytes(slot);
            Reading::new(ChannelKey::indexed(class, idx), Measurement::Value(round3(raw as f64 * class.scale())))
        })
        .collect();
    Ok(readings)
}

pub fn decode_energy_totals(payload: &[u8], calibration: &Calibration) -> Result<Vec<Reading>, DecodeError> {
    need(payload, 16, "energy totals")?;
    let readings = ENERGY_KEYS
        .iter()
        .enumerate()
        .map(|(idx, key)| {
            let raw = u32::from_be_bytes(swapped_slot(payload, idx));
            let value = if raw == NO_VALUE_SENTINEL {
                Measurement::NoValue
            } else {
                Measurement::Value(round3(raw as f64 * calibration.kt))
            };
            Reading::new(ChannelKey::new(*key), value)
        })
        .collect();
    Ok(readings)
}

pub fn decode_float_group(payload: &[u8], class: MeasurementClass) -> Result<Vec<Reading>, DecodeError> {
    need(payload, 16, "float group")?;
    let readings = (0..4)
        .map(|idx| {
            let b = &payload[idx * 4..idx * 4 + 4];
            let raw = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            let value = if raw.is_finite() {
                Measurement::Value(round3(raw as f64))
            } else {
                Measurement::NoValue
            };
            Reading::new(ChannelKey::indexed(class, idx), value)
        })
        .collect();
    Ok(readings)
}

pub fn decode_uint16(payload: &[u8], chan: &ChannelKey) -> Result<Vec<Reading>, DecodeError> {
    need(payload, 2, "uint16")?;
    let raw = u16::from_be_bytes([payload[0], payload[1]]);
    Ok(vec![Reading::new(chan.clone(), Measurement::Value(round3(raw as f64)))])
}

/// Turn the payload of a reply into readings
pub fn decode(
    decoder: Decoder,
    payload: &[u8],
    class: MeasurementClass,
    chan: Option<&ChannelKey>,
    calibration: &Calibration,
) -> Result<Vec<Reading>, DecodeError> {
    debug!("Decoding {:?} for {:?} from {}", decoder, class, hex::encode(payload));
    let fallback = ChannelKey::of_class(class);
    let chan = chan.unwrap_or(&fallback);

    match decoder {
        Decoder::ScaledValue => decode_scaled_value(payload, class, chan),
        Decoder::ScaledValueArray => decode_scaled_value_array(payload, class),
        Decoder::EnergyTotals => decode_energy_totals(payload, calibration),
        Decoder::FloatGroup => decode_float_group(payload, class),
        Decoder::Uint16 => decode_uint16(payload, chan),
    }
}

/* Service replies */

pub fn decode_serial_number(payload: &[u8]) -> Result<u32, DecodeError> {
    need(payload, 7, "serial number")?;
    Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

/// Returns (ktu, kti)
pub fn decode_coefficients(payload: &[u8]) -> Result<(u16, u16), DecodeError> {
    need(payload, 4, "transformation coefficients")?;
    Ok((
        u16::from_be_bytes([payload[0], payload[1]]),
        u16::from_be_bytes([payload[2], payload[3]]),
    ))
}

/// Pulse constant (imp/kWh) from the device variant, 0 when unknown
pub fn decode_variant_constant(payload: &[u8]) -> Result<u32, DecodeError> {
    need(payload, 3, "device variant")?;
    Ok(match payload[1] & 0x0f {
        0 => 5000,
        1 => 2500,
        2 => 1250,
        3 => 6250,
        4 => 500,
        5 => 250,
        6 => 6400,
        _ => 0,
    })
}
