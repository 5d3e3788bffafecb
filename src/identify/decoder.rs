//! Classifier payload decoding.
//!
//! Canonical path: tokens are joined with `,`, upper-cased, and tested for the
//! `ALL_OFF` / `ALL_ON` sentinels before whole-word label matching. Bit matrices
//! take the legacy positional path against `LabelSet::legacy_order`.
//!
//! The verdict map is always total over the label set; an empty or unmatched
//! payload yields all offline.

use crate::models::meter::{DeviceStatus, RawClassifierPayload};
use std::collections::BTreeMap;

pub const SENTINEL_ALL_OFF: &str = "ALL_OFF";
pub const SENTINEL_ALL_ON: &str = "ALL_ON";

const DEFAULT_LABELS: [(&str, &str); 3] = [("7", "Bulb 7W"), ("12", "Bulb 12W"), ("15", "Bulb 15W")];
const DEFAULT_LEGACY_ORDER: [&str; 3] = ["12", "15", "7"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    /// Upper-cased word token emitted by the classifier, e.g. "12".
    pub token: String,
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<Label>,
    legacy_order: Vec<String>,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl LabelSet {
    pub fn new<I, T, N>(pairs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (T, N)>,
        T: Into<String>,
        N: Into<String>,
    {
        let mut labels: Vec<Label> = Vec::new();
        for (token, name) in pairs {
            let (token, name): (String, String) = (token.into(), name.into());
            let token = token.trim().to_ascii_uppercase();
            let device_name = name.trim().to_string();
            if token.is_empty() || !token.chars().all(is_word_char) {
                return Err(format!("label token {token:?} must be a non-empty word (A-Z, 0-9, _)"));
            }
            if device_name.is_empty() {
                return Err(format!("label {token} has an empty device name"));
            }
            if labels.iter().any(|l| l.token == token) {
                return Err(format!("duplicate label token {token}"));
            }
            if labels.iter().any(|l| l.device_name == device_name) {
                return Err(format!("device name {device_name:?} mapped to more than one label"));
            }
            labels.push(Label { token, device_name });
        }
        if labels.is_empty() {
            return Err("label set must not be empty".to_string());
        }

        let legacy_order = DEFAULT_LEGACY_ORDER
            .iter()
            .map(|t| t.to_string())
            .filter(|t| labels.iter().any(|l| &l.token == t))
            .collect();
        Ok(LabelSet { labels, legacy_order })
    }

    /// Parse `"7=Bulb 7W,12=Bulb 12W"`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let pairs = raw
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                part.split_once('=')
                    .map(|(t, n)| (t.to_string(), n.to_string()))
                    .ok_or_else(|| format!("label entry {part:?} is missing '='"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        LabelSet::new(pairs)
    }

    /// Replace the positional order used for bit-matrix payloads.
    pub fn with_legacy_order<I, T>(mut self, order: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut tokens = Vec::new();
        for t in order {
            let token = t.as_ref().trim().to_ascii_uppercase();
            if !self.labels.iter().any(|l| l.token == token) {
                return Err(format!("legacy bit order references unknown label {token}"));
            }
            if tokens.contains(&token) {
                return Err(format!("legacy bit order repeats label {token}"));
            }
            tokens.push(token);
        }
        self.legacy_order = tokens;
        Ok(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn legacy_order(&self) -> &[String] {
        &self.legacy_order
    }

    /// Label token for a device, matched on the exact device name.
    pub fn token_for_device(&self, device_name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.device_name == device_name)
            .map(|l| l.token.as_str())
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        LabelSet {
            labels: DEFAULT_LABELS
                .iter()
                .map(|(token, name)| Label {
                    token: token.to_string(),
                    device_name: name.to_string(),
                })
                .collect(),
            legacy_order: DEFAULT_LEGACY_ORDER.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Verdict {
    Online,
    Offline,
}

impl Verdict {
    pub fn status(self) -> DeviceStatus {
        match self {
            Verdict::Online => DeviceStatus::Online,
            Verdict::Offline => DeviceStatus::Offline,
        }
    }
}

/// Which rule produced a decoded state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeRule {
    AllOff,
    AllOn,
    Tokens,
    LegacyBits,
    /// Forced by the heartbeat, not the classifier.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedState {
    pub rule: DecodeRule,
    verdicts: BTreeMap<String, Verdict>,
}

impl DecodedState {
    pub fn uniform(labels: &LabelSet, verdict: Verdict, rule: DecodeRule) -> Self {
        DecodedState {
            rule,
            verdicts: labels.iter().map(|l| (l.token.clone(), verdict)).collect(),
        }
    }

    pub fn get(&self, token: &str) -> Option<Verdict> {
        self.verdicts.get(token).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Verdict)> {
        self.verdicts.iter().map(|(t, v)| (t.as_str(), *v))
    }

    pub fn online_tokens(&self) -> Vec<&str> {
        self.iter().filter(|(_, v)| *v == Verdict::Online).map(|(t, _)| t).collect()
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}

fn word_tokens(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !is_word_char(c)).filter(|t| !t.is_empty())
}

pub fn decode(payload: &RawClassifierPayload, labels: &LabelSet) -> DecodedState {
    // canonical search string: tokens joined with `,`, upper-cased
    let joined = match payload {
        RawClassifierPayload::BitMatrix(rows) => return decode_legacy_bits(rows, labels),
        RawClassifierPayload::Null => String::new(),
        RawClassifierPayload::Scalar(s) => s.to_uppercase(),
        RawClassifierPayload::TokenList(tokens) => tokens.join(",").to_uppercase(),
    };
    if joined.contains(SENTINEL_ALL_OFF) {
        return DecodedState::uniform(labels, Verdict::Offline, DecodeRule::AllOff);
    }
    if joined.contains(SENTINEL_ALL_ON) {
        return DecodedState::uniform(labels, Verdict::Online, DecodeRule::AllOn);
    }

    let found: Vec<&str> = word_tokens(&joined).collect();
    let verdicts = labels
        .iter()
        .map(|l| {
            let verdict = if found.contains(&l.token.as_str()) {
                Verdict::Online
            } else {
                Verdict::Offline
            };
            (l.token.clone(), verdict)
        })
        .collect();
    DecodedState {
        rule: DecodeRule::Tokens,
        verdicts,
    }
}

/// Legacy positional decode of `[[bit, bit, bit]]`: only the first row counts.
pub fn decode_legacy_bits(rows: &[Vec<u8>], labels: &LabelSet) -> DecodedState {
    let first = rows.first().map(Vec::as_slice).unwrap_or(&[]);
    let mut state = DecodedState::uniform(labels, Verdict::Offline, DecodeRule::LegacyBits);
    for (token, bit) in labels.legacy_order().iter().zip(first) {
        if *bit != 0 {
            state.verdicts.insert(token.clone(), Verdict::Online);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdicts(state: &DecodedState) -> Vec<(String, Verdict)> {
        let mut out: Vec<_> = state.iter().map(|(t, v)| (t.to_string(), v)).collect();
        out.sort_by_key(|(t, _)| t.parse::<u32>().unwrap_or(u32::MAX));
        out
    }

    fn expect(state: &DecodedState, seven: Verdict, twelve: Verdict, fifteen: Verdict) {
        assert_eq!(
            verdicts(state),
            vec![("7".into(), seven), ("12".into(), twelve), ("15".into(), fifteen)]
        );
    }

    fn tokens(items: &[&str]) -> RawClassifierPayload {
        RawClassifierPayload::TokenList(items.iter().map(|s| s.to_string()).collect())
    }

    use Verdict::{Offline, Online};

    #[test]
    fn all_off_wins_in_any_position_and_case() {
        let labels = LabelSet::default();
        for payload in [
            RawClassifierPayload::Scalar("all_off".into()),
            tokens(&["12", "ALL_OFF"]),
            tokens(&["all_on", "All_Off"]),
        ] {
            let state = decode(&payload, &labels);
            assert_eq!(state.rule, DecodeRule::AllOff);
            expect(&state, Offline, Offline, Offline);
        }
    }

    #[test]
    fn all_on_marks_everything_online() {
        let state = decode(&tokens(&["7", "all_on"]), &LabelSet::default());
        assert_eq!(state.rule, DecodeRule::AllOn);
        expect(&state, Online, Online, Online);
    }

    #[test]
    fn single_and_multiple_labels() {
        let labels = LabelSet::default();
        expect(&decode(&RawClassifierPayload::Scalar("12".into()), &labels), Offline, Online, Offline);
        expect(&decode(&tokens(&["7", "12"]), &labels), Online, Online, Offline);
        expect(&decode(&RawClassifierPayload::Scalar("7,12".into()), &labels), Online, Online, Offline);
        expect(&decode(&tokens(&["15"]), &labels), Offline, Offline, Online);
    }

    #[test]
    fn null_and_empty_are_fail_safe_offline() {
        let labels = LabelSet::default();
        let state = decode(&RawClassifierPayload::Null, &labels);
        assert_eq!(state.rule, DecodeRule::Tokens);
        expect(&state, Offline, Offline, Offline);
        expect(&decode(&tokens(&[]), &labels), Offline, Offline, Offline);
    }

    #[test]
    fn word_boundaries_prevent_substring_matches() {
        let labels = LabelSet::default();
        expect(&decode(&RawClassifierPayload::Scalar("712".into()), &labels), Offline, Offline, Offline);
        expect(&decode(&RawClassifierPayload::Scalar("7W".into()), &labels), Offline, Offline, Offline);
        expect(&decode(&RawClassifierPayload::Scalar("bulb_15".into()), &labels), Offline, Offline, Offline);
        expect(&decode(&RawClassifierPayload::Scalar("[12] 15.0".into()), &labels), Offline, Online, Online);
    }

    #[test]
    fn legacy_bits_use_positional_order() {
        let labels = LabelSet::default();
        // order is 12, 15, 7
        let state = decode(&RawClassifierPayload::BitMatrix(vec![vec![1, 0, 1]]), &labels);
        assert_eq!(state.rule, DecodeRule::LegacyBits);
        expect(&state, Online, Online, Offline);

        let short = decode(&RawClassifierPayload::BitMatrix(vec![vec![0, 1]]), &labels);
        expect(&short, Offline, Offline, Online);

        let empty = decode_legacy_bits(&[], &labels);
        expect(&empty, Offline, Offline, Offline);
    }

    #[test]
    fn label_set_parsing_and_validation() {
        let labels = LabelSet::parse("7=Bulb 7W, 12=Bulb 12W,60=Fan 60W").expect("valid labels");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.token_for_device("Fan 60W"), Some("60"));
        assert_eq!(labels.token_for_device("fan 60w"), None);
        // unknown tokens are dropped from the default legacy order
        assert_eq!(labels.legacy_order(), &["12".to_string(), "7".to_string()]);

        assert!(LabelSet::parse("7=Bulb 7W,7=Other").is_err());
        assert!(LabelSet::parse("7 W=Bulb").is_err());
        assert!(LabelSet::parse("").is_err());
        assert!(LabelSet::default().with_legacy_order(["12", "99"]).is_err());
    }

    #[test]
    fn custom_word_labels_match_case_insensitively() {
        let labels = LabelSet::parse("kettle=Kettle,fan=Ceiling Fan").expect("valid labels");
        let state = decode(&tokens(&["Kettle"]), &labels);
        assert_eq!(state.get("KETTLE"), Some(Online));
        assert_eq!(state.get("FAN"), Some(Offline));
        assert_eq!(state.online_tokens(), vec!["KETTLE"]);
    }
}
