//! FITS primary-header reading.
//!
//! A FITS header is a sequence of 2880-byte blocks holding 80-character
//! cards, terminated by an `END` card. Only the primary header is read; pixel
//! data is never touched by the pipeline core.
//!
//! Example cards:
//! OBJECT  = 'SN2023abc'          / Target name
//! EXPTIME =               1200.0 / Exposure time
//! DISPAXIS=                    2

use crate::config::InstrumentConfig;
use crate::error::{PipelineError, Result};
use crate::frame::raw::{RawFrame, active_filter};

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BLOCK_LEN: usize = 2880;
const CARD_LEN: usize = 80;
/// Headers longer than this are treated as corrupt.
const MAX_BLOCKS: usize = 64;

/// Anything that can describe a frame on disk by its header attributes.
pub trait HeaderSource {
    fn frame(&self, path: &Path) -> Result<RawFrame>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Text(String),
    Logical(bool),
    Integer(i64),
    Real(f64),
}

impl CardValue {
    pub fn as_text(&self) -> String {
        match self {
            CardValue::Text(s) => s.clone(),
            CardValue::Logical(b) => if *b { "T" } else { "F" }.to_string(),
            CardValue::Integer(i) => i.to_string(),
            CardValue::Real(r) => r.to_string(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CardValue::Integer(i) => Some(*i as f64),
            CardValue::Real(r) => Some(*r),
            CardValue::Text(s) => s.trim().parse().ok(),
            CardValue::Logical(_) => None,
        }
    }
}

pub type Header = BTreeMap<String, CardValue>;

/// Read and parse the primary header of the FITS file at `path`.
pub fn read_header(path: &Path) -> Result<Header> {
    let mut file = File::open(path).map_err(|e| PipelineError::classification(path, e))?;

    let mut bytes = Vec::new();
    let mut block = [0u8; BLOCK_LEN];
    loop {
        file.read_exact(&mut block)
            .map_err(|e| PipelineError::classification(path, format!("truncated header: {}", e)))?;
        bytes.extend_from_slice(&block);
        if block.chunks(CARD_LEN).any(is_end_card) {
            break;
        }
        if bytes.len() >= MAX_BLOCKS * BLOCK_LEN {
            return Err(PipelineError::classification(path, "no END card found"));
        }
    }

    parse_cards(&bytes).map_err(|e| PipelineError::classification(path, e))
}

fn is_end_card(card: &[u8]) -> bool {
    card.starts_with(b"END") && card[3..].iter().all(|b| *b == b' ')
}

/// Parse raw header bytes into keyword -> value. Commentary cards are dropped.
pub fn parse_cards(bytes: &[u8]) -> std::result::Result<Header, String> {
    // String values are quoted, with '' as an escaped quote; anything else
    // runs up to the comment separator.
    let string_re = Regex::new(r"^\s*'((?:[^']|'')*)'").map_err(|e| e.to_string())?;

    let mut out = Header::new();
    for (idx, card) in bytes.chunks(CARD_LEN).enumerate() {
        if card.len() < CARD_LEN {
            return Err(format!("card {} is truncated", idx + 1));
        }
        if !card.is_ascii() {
            return Err(format!("card {} is not ASCII", idx + 1));
        }
        let card = std::str::from_utf8(card).map_err(|e| format!("card {}: {}", idx + 1, e))?;

        if idx == 0 && !card.starts_with("SIMPLE") {
            return Err("not a FITS file (first card is not SIMPLE)".to_string());
        }
        if is_end_card(card.as_bytes()) {
            break;
        }

        let keyword = card[..8].trim_end();
        if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" || keyword == "HIERARCH" {
            continue;
        }
        if &card[8..10] != "= " {
            continue;
        }

        let raw = &card[10..];
        let value = if let Some(caps) = string_re.captures(raw) {
            CardValue::Text(caps[1].replace("''", "'").trim_end().to_string())
        } else {
            let text = raw.split('/').next().unwrap_or("").trim();
            parse_scalar(text)
        };

        out.insert(keyword.to_string(), value);
    }

    Ok(out)
}

fn parse_scalar(text: &str) -> CardValue {
    match text {
        "T" => return CardValue::Logical(true),
        "F" => return CardValue::Logical(false),
        _ => {}
    }
    if let Ok(i) = text.parse::<i64>() {
        return CardValue::Integer(i);
    }
    // Fortran-style exponents are legal in FITS.
    if let Ok(r) = text.replace(['D', 'd'], "E").parse::<f64>() {
        return CardValue::Real(r);
    }
    CardValue::Text(text.to_string())
}

/// Reads headers from disk and maps instrument keywords onto frame attributes.
#[derive(Debug, Clone)]
pub struct FitsHeaders {
    instrument: InstrumentConfig,
}

impl FitsHeaders {
    pub fn new(instrument: InstrumentConfig) -> Self {
        Self { instrument }
    }

    /// Map a parsed header onto frame attributes.
    pub fn frame_from_header(&self, path: &Path, header: &Header) -> Result<RawFrame> {
        let kw = &self.instrument;
        let text = |key: &str| header.get(key).map(|v| v.as_text().trim().to_string());

        let image_type = text(&kw.image_type)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                PipelineError::classification(path, format!("missing {} keyword", kw.image_type))
            })?
            .to_uppercase();

        let slit = text(&kw.slit).unwrap_or_default();

        // The first filter wheel holding a real filter wins.
        let filters: Vec<String> = kw.filters.iter().filter_map(|k| text(k)).collect();
        let filter = filters
            .iter()
            .find(|f| active_filter(f, &kw.no_filter).is_some())
            .or_else(|| filters.first())
            .cloned()
            .unwrap_or_default();

        let dispaxis = match header.get(&kw.dispaxis) {
            Some(CardValue::Integer(axis @ (1 | 2))) => *axis as u8,
            Some(other) => {
                return Err(PipelineError::classification(
                    path,
                    format!("invalid {}: {}", kw.dispaxis, other.as_text()),
                ));
            }
            None if slit.to_lowercase().contains("horiz") => 1,
            None => 2,
        };

        let date_obs = match text(&kw.date_obs) {
            Some(s) if !s.is_empty() => Some(parse_date_obs(&s).ok_or_else(|| {
                PipelineError::classification(path, format!("unreadable {}: {}", kw.date_obs, s))
            })?),
            _ => None,
        };

        let axis_len = |key: &str| {
            header
                .get(key)
                .and_then(CardValue::as_f64)
                .map(|v| v as usize)
                .unwrap_or(0)
        };

        Ok(RawFrame {
            path: path.to_path_buf(),
            object: text(&kw.object).unwrap_or_default(),
            image_type,
            obs_mode: text(&kw.obs_mode).unwrap_or_default().to_uppercase(),
            grism: text(&kw.grism).unwrap_or_default(),
            slit,
            filter,
            exptime: header
                .get(&kw.exptime)
                .and_then(CardValue::as_f64)
                .unwrap_or(0.0),
            dispaxis,
            date_obs,
            shape: (axis_len("NAXIS2"), axis_len("NAXIS1")),
        })
    }
}

impl HeaderSource for FitsHeaders {
    fn frame(&self, path: &Path) -> Result<RawFrame> {
        let header = read_header(path)?;
        self.frame_from_header(path, &header)
    }
}

pub fn parse_date_obs(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn card(text: &str) -> String {
        format!("{:<80}", text)
    }

    fn header_bytes(cards: &[&str]) -> Vec<u8> {
        let mut s: String = cards.iter().map(|c| card(c)).collect();
        s.push_str(&card("END"));
        while s.len() % BLOCK_LEN != 0 {
            s.push(' ');
        }
        s.into_bytes()
    }

    #[test]
    fn parses_typed_values() {
        let bytes = header_bytes(&[
            "SIMPLE  =                    T / conforms",
            "NAXIS1  =                 2148",
            "EXPTIME =               1200.5 / seconds",
            "OBJECT  = 'O''Hara star'       / quoted quote",
            "COMMENT this card is ignored",
            "SCALE   =              1.5D-01",
        ]);
        let header = parse_cards(&bytes).unwrap();
        assert_eq!(header.get("SIMPLE"), Some(&CardValue::Logical(true)));
        assert_eq!(header.get("NAXIS1"), Some(&CardValue::Integer(2148)));
        assert_eq!(header.get("EXPTIME"), Some(&CardValue::Real(1200.5)));
        assert_eq!(
            header.get("OBJECT"),
            Some(&CardValue::Text("O'Hara star".to_string()))
        );
        assert_eq!(header.get("SCALE"), Some(&CardValue::Real(0.15)));
        assert!(!header.contains_key("COMMENT"));
    }

    #[test]
    fn rejects_non_fits_input() {
        let bytes = header_bytes(&["OBJECT  = 'x'"]);
        assert!(parse_cards(&bytes).is_err());
    }

    #[test]
    fn non_ascii_card_is_an_error_not_a_panic() {
        let bytes = header_bytes(&["SIMPLE  =                    T", "ABCDEFGé= 1"]);
        let err = parse_cards(&bytes).unwrap_err();
        assert_eq!(err, "card 2 is not ASCII");
    }

    #[test]
    fn maps_instrument_keywords() {
        let headers = FitsHeaders::new(InstrumentConfig::default());
        let bytes = header_bytes(&[
            "SIMPLE  =                    T",
            "NAXIS1  =                  400",
            "NAXIS2  =                 2052",
            "IMAGETYP= 'object  '",
            "OBS_MODE= 'Spectroscopy'",
            "OBJECT  = 'SN2023abc'",
            "ALGRNM  = 'Grism_#4'",
            "ALAPRTNM= 'Slit_1.0'",
            "FAFLTNM = 'Open    '",
            "FBFLTNM = 'GG475   '",
            "EXPTIME =               1800.0",
            "DATE-OBS= '2023-03-01T22:14:05.120'",
        ]);
        let header = parse_cards(&bytes).unwrap();
        let frame = headers
            .frame_from_header(Path::new("raw/ALDc010123.fits"), &header)
            .unwrap();

        assert_eq!(frame.image_type, "OBJECT");
        assert_eq!(frame.obs_mode, "SPECTROSCOPY");
        assert_eq!(frame.filter, "GG475");
        assert_eq!(frame.dispaxis, 2);
        assert_eq!(frame.shape, (2052, 400));
        assert_eq!(
            frame.date_obs,
            parse_date_obs("2023-03-01T22:14:05.120")
        );
    }

    #[test]
    fn missing_image_type_is_a_classification_error() {
        let headers = FitsHeaders::new(InstrumentConfig::default());
        let header = parse_cards(&header_bytes(&["SIMPLE  =                    T"])).unwrap();
        let err = headers
            .frame_from_header(Path::new("x.fits"), &header)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Classification { .. }));
    }

    #[test]
    fn reads_header_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bias.fits");
        let mut f = File::create(&path).unwrap();
        f.write_all(&header_bytes(&[
            "SIMPLE  =                    T",
            "IMAGETYP= 'BIAS'",
        ]))
        .unwrap();

        let frame = FitsHeaders::new(InstrumentConfig::default())
            .frame(&path)
            .unwrap();
        assert_eq!(frame.image_type, "BIAS");
        assert_eq!(frame.path, path);

        let truncated = dir.path().join("short.fits");
        std::fs::write(&truncated, b"SIMPLE  =   T").unwrap();
        assert!(FitsHeaders::new(InstrumentConfig::default()).frame(&truncated).is_err());
    }
}
