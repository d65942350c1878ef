//! Recognizer response parsing.
//!
//! Vision models answer in free-form text: sometimes clean JSON, sometimes JSON
//! wrapped in prose or code fences, sometimes labelled lines. Parsing tries, in
//! order:
//! 1. the first embedded JSON object that deserialises
//! 2. `<label>: <value>` lines
//! 3. a reply that is nothing but the value
//!
//! Everything here is pure: the same text and kind always give the same answer,
//! and unparseable text gives `None` rather than an error.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

use crate::challenge::{Answer, ChallengeKind};

/// Compile a pattern once and hand out a `&'static Regex`
macro_rules! regex {
    ($re:literal $(,)?) => {{
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new($re).expect("valid regex pattern"))
    }};
}

const TARGET_KEYS: &[&str] = &["targetChars", "targetSequence", "target_chars", "target"];
const MAPPING_KEYS: &[&str] = &["gridMapping", "positionMap", "positions", "grid_mapping"];
const MATH_KEYS: &[&str] = &["answer", "result", "value", "答案"];
const CODE_KEYS: &[&str] = &["text", "code", "captcha", "answer", "验证码"];

/// Parse raw recognizer text into an answer for `kind`
pub fn parse(raw: &str, kind: ChallengeKind) -> Option<Answer> {
    match kind {
        ChallengeKind::Math => parse_math(raw),
        ChallengeKind::ChineseClick => parse_clicks(raw),
        ChallengeKind::AlphanumericText => parse_code(raw),
    }
}

/// Numbering convention detected in a position map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBase {
    ZeroBased,
    OneBased,
}

/// Detect the index base: a map containing 0 is zero-based
pub fn detect_index_base(positions: &BTreeMap<String, i64>) -> IndexBase {
    match positions.values().filter(|p| **p >= 0).min() {
        Some(0) => IndexBase::ZeroBased,
        _ => IndexBase::OneBased,
    }
}

/// Normalise recognised positions to 1-based.
///
/// Negative values are dropped. If the smallest remaining value is 0 the whole
/// map is shifted by one; otherwise it is returned unchanged.
pub fn normalize_positions(positions: &BTreeMap<String, i64>) -> BTreeMap<String, u32> {
    let base = detect_index_base(positions);
    let offset = match base {
        IndexBase::ZeroBased => 1,
        IndexBase::OneBased => 0,
    };
    debug!("Glyph positions look {:?}; shifting by {}", base, offset);

    positions
        .iter()
        .filter(|(_, p)| **p >= 0)
        .filter_map(|(glyph, p)| u32::try_from(p + offset).ok().map(|p| (glyph.clone(), p)))
        .collect()
}

/// Find the first JSON object embedded in `raw`.
///
/// Every `{` is tried as a start; the candidate runs to its balancing `}`
/// (braces inside strings are ignored). The first candidate that deserialises
/// to an object wins.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    for (start, _) in raw.match_indices('{') {
        let Some(len) = balanced_len(&raw[start..]) else {
            continue;
        };
        if let Ok(Value::Object(map)) = serde_json::from_str(&raw[start..start + len]) {
            return Some(map);
        }
    }
    None
}

/// Byte length of the brace-balanced prefix of `s` (which starts with `{`)
fn balanced_len(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn first_key<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key)).filter(|v| !v.is_null())
}

fn is_glyph(c: char) -> bool {
    !c.is_ascii() && c.is_alphanumeric()
}

fn first_integer(text: &str) -> Option<i64> {
    regex!(r"-?\d+")
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
}

// ============================================================================
// Chinese click
// ============================================================================

fn parse_clicks(raw: &str) -> Option<Answer> {
    if let Some(obj) = extract_json_object(raw) {
        if let Some(answer) = clicks_from_json(&obj) {
            return Some(answer);
        }
        debug!("JSON object lacks a usable target sequence or mapping; trying labelled lines");
    }
    clicks_from_text(raw)
}

fn clicks_from_json(obj: &Map<String, Value>) -> Option<Answer> {
    let sequence = match first_key(obj, TARGET_KEYS)? {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Value::String(s) => split_sequence(s),
        _ => return None,
    };

    let mapping = first_key(obj, MAPPING_KEYS)?.as_object()?;
    let positions: BTreeMap<String, i64> = mapping
        .iter()
        .filter_map(|(glyph, value)| {
            let position = match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                Value::String(s) => first_integer(s),
                _ => None,
            }?;
            Some((glyph.trim().to_string(), position))
        })
        .collect();

    build_clicks(sequence, &positions)
}

fn split_sequence(s: &str) -> Vec<String> {
    s.split(|c: char| matches!(c, '→' | ',' | '，' | '、' | '>' | '-') || c.is_whitespace())
        .map(|piece| {
            piece.trim_matches(|c: char| {
                matches!(c, '"' | '\'' | '“' | '”' | '[' | ']' | '【' | '】' | '「' | '」')
            })
        })
        .filter(|piece| !piece.is_empty())
        .map(String::from)
        .collect()
}

fn clicks_from_text(raw: &str) -> Option<Answer> {
    let target_line = regex!(
        r"(?im)^[\s\-*•]*(?:目标(?:字符序列|字符|序列)?|请依次点击|target(?:\s*(?:chars|characters|sequence))?)\s*[:：]\s*(.+)$"
    );
    let position_line = regex!(
        r"(?im)^[\s\-*•·]*(?:\d+[.)、]\s*)?[“「'\x22]?(\S)[”」'\x22]?\s*[:：]\s*(?:位置|第|position|pos)?\s*(\d+)"
    );

    let sequence: Vec<String> = target_line
        .captures(raw)?
        .get(1)?
        .as_str()
        .chars()
        .filter(|c| is_glyph(*c))
        .map(String::from)
        .collect();

    let mut positions = BTreeMap::new();
    for caps in position_line.captures_iter(raw) {
        let (Some(glyph), Some(position)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let glyph = glyph.as_str();
        if !glyph.chars().all(is_glyph) {
            continue;
        }
        if let Ok(position) = position.as_str().parse::<i64>() {
            positions.entry(glyph.to_string()).or_insert(position);
        }
    }

    build_clicks(sequence, &positions)
}

fn build_clicks(sequence: Vec<String>, positions: &BTreeMap<String, i64>) -> Option<Answer> {
    if sequence.is_empty() {
        return None;
    }
    let position_map = normalize_positions(positions);
    if position_map.is_empty() {
        return None;
    }
    Some(Answer::Clicks {
        target_sequence: sequence,
        position_map,
    })
}

// ============================================================================
// Math
// ============================================================================

fn parse_math(raw: &str) -> Option<Answer> {
    if let Some(obj) = extract_json_object(raw) {
        let value = first_key(&obj, MATH_KEYS).and_then(|v| match v {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => number_from_fragment(s),
            _ => None,
        });
        if let Some(value) = value {
            return Some(Answer::text(value.to_string()));
        }
    }

    let label = regex!(r"(?i)(?:最终答案|答案|结果|answer|result)\s*(?:is|为|是|=)?\s*[:：]?\s*([^\n]+)");
    if let Some(value) = label
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| number_from_fragment(m.as_str()))
    {
        return Some(Answer::text(value.to_string()));
    }

    if let Some(value) = trailing_equals(raw).or_else(|| evaluate_expression(raw)) {
        return Some(Answer::text(value.to_string()));
    }

    let bare = raw.trim().trim_end_matches(['。', '.', '!', '！']);
    bare.parse::<i64>().ok().map(|v| Answer::text(v.to_string()))
}

/// Read a number out of a label's value: `9+6=15`, `15 (9+6)`, `9+6` or `15`
fn number_from_fragment(fragment: &str) -> Option<i64> {
    trailing_equals(fragment)
        .or_else(|| leading_integer(fragment))
        .or_else(|| evaluate_expression(fragment))
        .or_else(|| first_integer(fragment))
}

/// An integer opening the text, unless it is the left operand of an expression
fn leading_integer(text: &str) -> Option<i64> {
    let caps = regex!(r"^\s*(-?\d+)\s*(.*)").captures(text)?;
    let rest = caps.get(2).map_or("", |m| m.as_str());
    if regex!(r"^[+\-*/×÷xX]\s*-?\d").is_match(rest) {
        return None;
    }
    caps.get(1)?.as_str().parse().ok()
}

fn trailing_equals(text: &str) -> Option<i64> {
    regex!(r"=\s*(-?\d+)")
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Evaluate the first `a op b` expression; division only when exact
fn evaluate_expression(text: &str) -> Option<i64> {
    let caps = regex!(r"(-?\d+)\s*([+\-*/×÷xX])\s*(-?\d+)").captures(text)?;
    let a: i64 = caps.get(1)?.as_str().parse().ok()?;
    let b: i64 = caps.get(3)?.as_str().parse().ok()?;
    match caps.get(2)?.as_str() {
        "+" => a.checked_add(b),
        "-" => a.checked_sub(b),
        "*" | "×" | "x" | "X" => a.checked_mul(b),
        "/" | "÷" if b != 0 && a % b == 0 => a.checked_div(b),
        _ => None,
    }
}

// ============================================================================
// Alphanumeric
// ============================================================================

fn parse_code(raw: &str) -> Option<Answer> {
    if let Some(obj) = extract_json_object(raw) {
        let value = first_key(&obj, CODE_KEYS).and_then(|v| match v {
            Value::String(s) => Some(clean_code(s)),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            return Some(Answer::text(value));
        }
    }

    let label = regex!(r#"(?i)(?:验证码|captcha|code|text|answer)\s*(?:is|为|是)?\s*[:：]\s*["'“]?([A-Za-z0-9]+)"#);
    if let Some(m) = label.captures(raw).and_then(|caps| caps.get(1)) {
        return Some(Answer::text(m.as_str()));
    }

    let bare: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if (4..=8).contains(&bare.len()) && bare.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Some(Answer::text(bare));
    }
    None
}

fn clean_code(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}
