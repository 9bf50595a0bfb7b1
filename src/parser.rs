//! ==============================================================================
//! parser.rs - device line parser
//! ==============================================================================
//!
//! purpose:
//!     turns one line of serial output into a measurement, a status message or
//!     "unrecognized". the firmware format is not stable, so the parser tries an
//!     ordered chain of decoders and always returns something:
//!
//! ```text
//!         trim ──► json object ──► positional (labels, `,`/`;`) ──► status / unrecognized
//! ```
//!
//! relationships:
//!     - called by: device.rs (one call per newline-terminated line)
//!     - uses: validate.rs (range check before a measurement is emitted)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::domain::{Measurement, Source, StatusLevel, StatusMessage};
use crate::validate::{self, parse_number};

const TEMPERATURE_KEYS: [&str; 3] = ["t", "temp", "temperature"];
const HUMIDITY_KEYS: [&str; 3] = ["h", "hum", "humidity"];

// longest first so "temp:" is not read as "t:" + "emp:"
const LABELS: [&str; 6] = ["temperature:", "humidity:", "temp:", "hum:", "t:", "h:"];

const ERROR_MARKERS: [&str; 8] = [
    "error", "errore", "err:", "fail", "fault", "timeout", "guasto", "disconn",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrecognizedReason {
    /// nothing resembling a reading or a sentence
    NoReading,
    /// two numbers were found but they are not physically plausible
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// blank line, silently dropped
    Empty,
    Measurement(Measurement),
    Status(StatusMessage),
    Unrecognized { line: String, reason: UnrecognizedReason },
}

/// parses one line received at `received_at`
pub fn parse_line(line: &str, received_at: DateTime<Utc>) -> ParsedLine {
    let line = line.trim();
    if line.is_empty() {
        return ParsedLine::Empty;
    }

    let candidate = match decode_object(line) {
        Some(Decoded::Pair(t, h)) => Some((t, h)),
        Some(Decoded::Status(text, level)) => {
            return ParsedLine::Status(StatusMessage { text, level, timestamp: received_at });
        }
        None => decode_positional(line),
    };

    if let Some((temperature, humidity)) = candidate {
        if !validate::is_plausible(temperature, humidity) {
            return unrecognized(line, UnrecognizedReason::OutOfRange);
        }
        return ParsedLine::Measurement(Measurement {
            temperature,
            humidity,
            timestamp: received_at,
            source: Source::Local,
            raw: Some(line.to_string()),
        });
    }

    if numeric_tokens(line).next().is_some() {
        // one stray number is neither a reading nor a sentence
        return unrecognized(line, UnrecognizedReason::NoReading);
    }

    let is_error = has_error_marker(line);
    if is_error || looks_like_sentence(line) {
        let level = if is_error { StatusLevel::Error } else { StatusLevel::Info };
        return ParsedLine::Status(StatusMessage {
            text: line.to_string(),
            level,
            timestamp: received_at,
        });
    }

    unrecognized(line, UnrecognizedReason::NoReading)
}

fn unrecognized(line: &str, reason: UnrecognizedReason) -> ParsedLine {
    ParsedLine::Unrecognized { line: line.to_string(), reason }
}

enum Decoded {
    Pair(f64, f64),
    Status(String, StatusLevel),
}

/// `{"t": 22.5, "h": 45}` and friends; numeric strings are accepted as values
fn decode_object(line: &str) -> Option<Decoded> {
    if !line.starts_with('{') {
        return None;
    }
    let object: Map<String, Value> = serde_json::from_str(line).ok()?;

    let lookup = |keys: &[&str]| -> Option<&Value> {
        object
            .iter()
            .find(|(k, _)| keys.iter().any(|key| k.eq_ignore_ascii_case(key)))
            .map(|(_, v)| v)
    };

    let temperature = lookup(&TEMPERATURE_KEYS).and_then(number_of);
    let humidity = lookup(&HUMIDITY_KEYS).and_then(number_of);
    if let (Some(t), Some(h)) = (temperature, humidity) {
        return Some(Decoded::Pair(t, h));
    }

    if let Some(text) = lookup(&["error"]).and_then(Value::as_str) {
        return Some(Decoded::Status(text.to_string(), StatusLevel::Error));
    }
    lookup(&["status", "message", "msg"])
        .and_then(Value::as_str)
        .map(|text| Decoded::Status(text.to_string(), StatusLevel::Info))
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// `22.5,45.0`, `TEMP:22.5;HUM:45`, `T: 22.5C, H: 45%`
fn decode_positional(line: &str) -> Option<(f64, f64)> {
    let mut numbers = numeric_tokens(line);
    let t = numbers.next()?;
    let h = numbers.next()?;
    Some((t, h))
}

/// `22,5;45,0`: with `;` between fields and no `.` anywhere, commas are decimal marks
fn uses_decimal_comma(line: &str) -> bool {
    line.contains(';') && line.contains(',') && !line.contains('.')
}

fn numeric_tokens(line: &str) -> impl Iterator<Item = f64> + '_ {
    let decimal_comma = uses_decimal_comma(line);
    let separators: &[char] = if decimal_comma { &[';'] } else { &[',', ';'] };

    line.split(separators).filter_map(move |piece| {
        let piece = strip_units(strip_label(piece));
        if decimal_comma {
            parse_number(&piece.replace(',', "."))
        } else {
            parse_number(piece)
        }
    })
}

fn strip_label(piece: &str) -> &str {
    let piece = piece.trim();
    for label in LABELS {
        if let Some(head) = piece.get(..label.len()) {
            if head.eq_ignore_ascii_case(label) {
                return piece[label.len()..].trim();
            }
        }
    }
    piece
}

fn strip_units(piece: &str) -> &str {
    piece.trim_end_matches(['%', 'C', 'c', '°', ' '])
}

fn has_error_marker(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// at least two real words, e.g. "Connesso alla rete"
fn looks_like_sentence(line: &str) -> bool {
    line.split_whitespace().filter(|word| is_word(word)).count() >= 2
}

fn is_word(word: &str) -> bool {
    let word = word.trim_end_matches(['.', ',', ':', ';', '!', '?', '\'']);
    word.chars().count() >= 2 && word.chars().all(|c| c.is_alphabetic() || c == '\'' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn reading(parsed: ParsedLine) -> (f64, f64) {
        match parsed {
            ParsedLine::Measurement(m) => (m.temperature, m.humidity),
            other => panic!("expected a measurement, got {other:?}"),
        }
    }

    #[test]
    fn plain_pair() {
        assert_eq!(reading(parse_line("22.5,45.0", now())), (22.5, 45.0));
        assert_eq!(reading(parse_line("  22.5 ; 45.0\r", now())), (22.5, 45.0));
    }

    #[test]
    fn json_with_synonyms() {
        assert_eq!(reading(parse_line(r#"{"t":22.5,"h":45.0}"#, now())), (22.5, 45.0));
        assert_eq!(reading(parse_line(r#"{"temp":"19.0","hum":60}"#, now())), (19.0, 60.0));
        assert_eq!(
            reading(parse_line(r#"{"Temperature":-3.5,"Humidity":88.1}"#, now())),
            (-3.5, 88.1)
        );
    }

    #[test]
    fn labelled_positional() {
        assert_eq!(reading(parse_line("TEMP:22.5,HUM:45.0", now())), (22.5, 45.0));
        assert_eq!(reading(parse_line("temp: 21.0C; hum: 40%", now())), (21.0, 40.0));
    }

    #[test]
    fn measurement_is_local_and_keeps_raw_line() {
        let at = now();
        match parse_line(" 22.5,45.0 ", at) {
            ParsedLine::Measurement(m) => {
                assert_eq!(m.source, Source::Local);
                assert_eq!(m.timestamp, at);
                assert_eq!(m.raw.as_deref(), Some("22.5,45.0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sentences_are_status() {
        match parse_line("Connesso alla rete", now()) {
            ParsedLine::Status(s) => {
                assert_eq!(s.level, StatusLevel::Info);
                assert_eq!(s.text, "Connesso alla rete");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_lines_are_error_status() {
        match parse_line("Errore lettura sensore DHT", now()) {
            ParsedLine::Status(s) => assert_eq!(s.level, StatusLevel::Error),
            other => panic!("unexpected {other:?}"),
        }
        match parse_line(r#"{"error":"sensor not found"}"#, now()) {
            ParsedLine::Status(s) => {
                assert_eq!(s.level, StatusLevel::Error);
                assert_eq!(s.text, "sensor not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_unrecognized() {
        assert!(matches!(
            parse_line("abc", now()),
            ParsedLine::Unrecognized { reason: UnrecognizedReason::NoReading, .. }
        ));
        assert!(matches!(
            parse_line("42", now()),
            ParsedLine::Unrecognized { reason: UnrecognizedReason::NoReading, .. }
        ));
        assert!(matches!(
            parse_line("{not json", now()),
            ParsedLine::Unrecognized { .. }
        ));
    }

    #[test]
    fn implausible_values_are_unrecognized() {
        assert!(matches!(
            parse_line("150.0,45.0", now()),
            ParsedLine::Unrecognized { reason: UnrecognizedReason::OutOfRange, .. }
        ));
        assert!(matches!(
            parse_line(r#"{"t":20,"h":140}"#, now()),
            ParsedLine::Unrecognized { reason: UnrecognizedReason::OutOfRange, .. }
        ));
    }

    #[test]
    fn decimal_comma_with_semicolon_fields() {
        assert_eq!(reading(parse_line("22,5;45,0", now())), (22.5, 45.0));
        assert_eq!(reading(parse_line("TEMP:22,5;HUM:45", now())), (22.5, 45.0));
        // a dot anywhere means commas are field separators again
        assert_eq!(reading(parse_line("22.5,45.0;", now())), (22.5, 45.0));
    }

    #[test]
    fn space_separated_labels_are_not_split() {
        assert!(matches!(
            parse_line("TEMP:22.5 HUM:45.0", now()),
            ParsedLine::Unrecognized { .. }
        ));
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_eq!(parse_line("   \r", now()), ParsedLine::Empty);
    }
}
