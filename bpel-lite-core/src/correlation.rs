//! Correlation keys and key sets.
//!
//! A correlation key pairs a correlation-set name with the property values
//! extracted from a message; a key set holds at most one key per set name,
//! ordered by set name. Key sets have a canonical string form used for
//! logging, persistence and route comparison:
//!
//! - `@2` — an empty key set
//! - `@2[1~a~b]` — one key (set `1`, values `a`, `b`)
//! - `@2[1~a~b],[2~b~c]` — two keys, sorted by set name
//!
//! Literal `~` inside a value is doubled; literal `]` inside a bracketed key
//! is doubled. A bare `name~v1~v2` string (no `@` prefix) is accepted as the
//! legacy single-key form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved set name for opaque session keys. A key set consisting of exactly
/// one session key routes only to catch-all "all" routes.
pub const SESSION_SET_NAME: &str = "-1";

// ─── CorrelationKey ───────────────────────────────────────────

/// One correlation key: a correlation-set name plus its ordered values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct CorrelationKey {
    set_name: String,
    values: Vec<String>,
}

impl CorrelationKey {
    pub fn new(set_name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            set_name: set_name.into(),
            values,
        }
    }

    /// An opaque session key carrying a transport-assigned session id.
    pub fn session(value: impl Into<String>) -> Self {
        Self::new(SESSION_SET_NAME, vec![value.into()])
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn is_session(&self) -> bool {
        self.set_name == SESSION_SET_NAME
    }

    /// Canonical form `name~v1~v2`, with literal tildes doubled.
    pub fn to_canonical(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&self.set_name);
        buf.push('~');
        for (i, value) in self.values.iter().enumerate() {
            if i != 0 {
                buf.push('~');
            }
            for ch in value.chars() {
                if ch == '~' {
                    buf.push_str("~~");
                } else {
                    buf.push(ch);
                }
            }
        }
        buf
    }

    /// Parse the canonical form. Tolerant: a string with no `~` is a key with
    /// that set name and no values.
    pub fn parse(canonical: &str) -> Self {
        let chars: Vec<char> = canonical.chars().collect();
        let Some(first_tilde) = chars.iter().position(|&c| c == '~') else {
            return Self {
                set_name: canonical.to_string(),
                values: Vec::new(),
            };
        };
        let set_name: String = chars[..first_tilde].iter().collect();
        let mut values = Vec::new();
        let mut work = String::new();
        let mut i = first_tilde + 1;
        while i < chars.len() {
            let is_last = i == chars.len() - 1;
            if chars[i] == '~' && !is_last && chars[i + 1] == '~' {
                work.push('~');
                i += 1;
            } else if chars[i] == '~' {
                values.push(std::mem::take(&mut work));
            } else {
                work.push(chars[i]);
            }
            i += 1;
        }
        values.push(work);
        Self { set_name, values }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

// ─── CorrelationKeySet ────────────────────────────────────────

/// A set of correlation keys, at most one per set name, ordered by set name.
///
/// Serialized as its canonical string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct CorrelationKeySet {
    keys: BTreeMap<String, CorrelationKey>,
}

impl CorrelationKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from keys; later keys replace earlier ones with the same
    /// set name.
    pub fn of(keys: impl IntoIterator<Item = CorrelationKey>) -> Self {
        let mut set = Self::new();
        for key in keys {
            set.add(key);
        }
        set
    }

    /// Add a key, replacing any existing key with the same set name.
    pub fn add(&mut self, key: CorrelationKey) -> &mut Self {
        self.keys.insert(key.set_name().to_string(), key);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CorrelationKey> {
        self.keys.values()
    }

    /// Exact membership: same set name and same values.
    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.keys.get(key.set_name()) == Some(key)
    }

    /// Superset test: every key of `other` is contained here.
    pub fn contains_all(&self, other: &CorrelationKeySet) -> bool {
        other.iter().all(|k| self.contains(k))
    }

    /// True when the set holds exactly one opaque session key.
    pub fn is_opaque(&self) -> bool {
        self.keys.len() == 1 && self.keys.contains_key(SESSION_SET_NAME)
    }

    /// Can a message carrying this key set be delivered to a route holding
    /// `candidate`? Ordinary routes need every candidate key present in the
    /// message; "all" routes additionally accept an opaque candidate when the
    /// message derived no keys at all.
    pub fn is_routable_to(&self, candidate: &CorrelationKeySet, all_route: bool) -> bool {
        let mut routable = self.contains_all(candidate);
        if all_route {
            routable = routable || (candidate.is_opaque() && self.is_empty());
        }
        routable
    }

    /// Canonical form: `@2` followed by `[key]` entries sorted by set name.
    pub fn to_canonical(&self) -> String {
        let mut buf = String::new();
        for key in self.keys.values() {
            if !buf.is_empty() {
                buf.push(',');
            }
            buf.push('[');
            for ch in key.to_canonical().chars() {
                if ch == ']' {
                    buf.push_str("]]");
                } else {
                    buf.push(ch);
                }
            }
            buf.push(']');
        }
        format!("@2{buf}")
    }

    /// Parse either the bracketed `@`-form or the legacy bare single-key
    /// form. Tolerant of malformed input: unparseable fragments are dropped.
    pub fn parse(canonical: &str) -> Self {
        let mut set = Self::new();
        let trimmed = canonical.trim();
        if trimmed.is_empty() {
            return set;
        }
        if !trimmed.starts_with('@') {
            set.add(CorrelationKey::parse(trimmed));
            return set;
        }

        #[derive(PartialEq)]
        enum State {
            Start,
            Version,
            InKey,
            AfterBracket,
            BetweenKeys,
        }

        let mut state = State::Start;
        let mut buf = String::new();
        for ch in trimmed.chars() {
            match state {
                State::Start => {
                    if ch == '@' {
                        state = State::Version;
                    } else {
                        buf.push(ch);
                        state = State::InKey;
                    }
                }
                State::Version => {
                    if ch == '[' {
                        buf.clear();
                        state = State::InKey;
                    } else {
                        buf.push(ch);
                    }
                }
                State::InKey => {
                    if ch == ']' {
                        state = State::AfterBracket;
                    } else {
                        buf.push(ch);
                    }
                }
                State::AfterBracket => {
                    if ch == ']' {
                        // escaped right bracket inside a key value
                        buf.push(ch);
                        state = State::InKey;
                    } else if ch == ',' {
                        if !buf.trim().is_empty() {
                            set.add(CorrelationKey::parse(&buf));
                        }
                        buf.clear();
                        state = State::BetweenKeys;
                    }
                }
                State::BetweenKeys => {
                    if ch == '[' {
                        state = State::InKey;
                    }
                }
            }
        }
        if !buf.trim().is_empty() && state != State::Version {
            set.add(CorrelationKey::parse(&buf));
        }
        set
    }
}

impl fmt::Display for CorrelationKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

impl From<CorrelationKeySet> for String {
    fn from(set: CorrelationKeySet) -> Self {
        set.to_canonical()
    }
}

impl From<String> for CorrelationKeySet {
    fn from(canonical: String) -> Self {
        CorrelationKeySet::parse(&canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ks(canonical: &str) -> CorrelationKeySet {
        CorrelationKeySet::parse(canonical)
    }

    #[test]
    fn key_canonical_round_trip() {
        let key = CorrelationKey::new("1", vec!["a".into(), "b".into()]);
        assert_eq!(key.to_canonical(), "1~a~b");
        assert_eq!(CorrelationKey::parse("1~a~b"), key);
    }

    #[test]
    fn key_escapes_tilde() {
        let key = CorrelationKey::new("1", vec!["a~b".into(), "c".into()]);
        assert_eq!(key.to_canonical(), "1~a~~b~c");
        assert_eq!(CorrelationKey::parse("1~a~~b~c"), key);
    }

    #[test]
    fn set_canonical_round_trip() {
        let set = ks("@2[1~a~b],[2~b~c]");
        assert_eq!(set.len(), 2);
        assert_eq!(set.to_canonical(), "@2[1~a~b],[2~b~c]");
    }

    #[test]
    fn set_orders_by_set_name() {
        let set = CorrelationKeySet::of([
            CorrelationKey::new("2", vec!["b".into(), "c".into()]),
            CorrelationKey::new("1", vec!["a".into(), "b".into()]),
        ]);
        assert_eq!(set.to_canonical(), "@2[1~a~b],[2~b~c]");
    }

    #[test]
    fn set_escapes_right_bracket() {
        let set = CorrelationKeySet::of([CorrelationKey::new("1", vec!["a]b".into()])]);
        let canonical = set.to_canonical();
        assert_eq!(canonical, "@2[1~a]]b]");
        assert_eq!(ks(&canonical), set);
    }

    #[test]
    fn parses_legacy_bare_form() {
        let set = ks("1~a~b");
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_canonical(), "@2[1~a~b]");
    }

    #[test]
    fn parses_empty_forms() {
        assert!(ks("@2").is_empty());
        assert!(ks("").is_empty());
        assert!(ks("   ").is_empty());
    }

    #[test]
    fn add_replaces_same_set_name() {
        let mut set = ks("@2[1~a~b]");
        set.add(CorrelationKey::new("1", vec!["z".into()]));
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_canonical(), "@2[1~z]");
    }

    #[test]
    fn contains_all_is_superset_test() {
        let sup = ks("@2[1~a~b],[2~b~c]");
        let sub = ks("@2[1~a~b]");
        assert!(sup.contains_all(&sub));
        assert!(!sub.contains_all(&sup));
        assert!(sup.contains_all(&sup));
        assert!(sup.contains_all(&CorrelationKeySet::new()));
    }

    #[test]
    fn contains_needs_equal_values() {
        let set = ks("@2[1~a~b]");
        assert!(!set.contains(&CorrelationKey::new("1", vec!["a".into()])));
        assert!(set.contains(&CorrelationKey::new("1", vec!["a".into(), "b".into()])));
    }

    #[test]
    fn routable_to_exact_candidate() {
        let message = ks("@2[1~a~b]");
        assert!(message.is_routable_to(&ks("@2[1~a~b]"), false));
        assert!(!message.is_routable_to(&ks("@2[1~a~b],[2~b~c]"), false));
    }

    #[test]
    fn opaque_candidate_needs_all_route() {
        let session = CorrelationKeySet::of([CorrelationKey::session("session_key")]);
        assert!(session.is_opaque());

        let empty_message = CorrelationKeySet::new();
        assert!(empty_message.is_routable_to(&session, true));
        assert!(!empty_message.is_routable_to(&session, false));

        // a message that derived keys does not fall back to the opaque route
        let keyed_message = ks("@2[1~a~b]");
        assert!(!keyed_message.is_routable_to(&session, true));
    }

    #[test]
    fn serde_uses_canonical_string() {
        let set = ks("@2[1~a~b],[2~b~c]");
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"@2[1~a~b],[2~b~c]\"");
        let back: CorrelationKeySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
