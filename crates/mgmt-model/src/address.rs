//! Path addresses for the resource tree
//!
//! Provides [`PathAddress`], an immutable sequence of `(type, name)` segments
//! identifying one resource. The empty address is the root resource.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Name used in registration patterns to match any sibling of a type
pub const WILDCARD: &str = "*";

/// One `(type, name)` segment of an address
///
/// # Examples
/// - `subsystem=web`
/// - `deployment=*` (pattern segment)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathElement {
    key: String,
    value: String,
}

impl PathElement {
    /// Create a segment
    #[inline]
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a wildcard segment matching every name of `key`
    #[inline]
    #[must_use]
    pub fn wildcard(key: impl Into<String>) -> Self {
        Self::new(key, WILDCARD)
    }

    /// Child type
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Child name
    #[inline]
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the name is the wildcard
    #[inline]
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.value == WILDCARD
    }

    /// Pattern match: same type, and same name unless `pattern` is a wildcard
    #[inline]
    #[must_use]
    pub fn matches(&self, pattern: &PathElement) -> bool {
        self.key == pattern.key && (pattern.is_wildcard() || self.value == pattern.value)
    }
}

impl Display for PathElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", quote(&self.key), quote(&self.value))
    }
}

/// Address of a resource
///
/// Never mutated in place: [`child`](Self::child), [`parent`](Self::parent)
/// and [`append`](Self::append) return new values. Ordering is lexicographic
/// by segment, so a parent sorts before its descendants and every subtree
/// occupies a contiguous range.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathAddress(SmallVec<[PathElement; 4]>);

impl PathAddress {
    /// The root address
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    /// Build from segments
    #[must_use]
    pub fn new(elements: impl IntoIterator<Item = PathElement>) -> Self {
        Self(elements.into_iter().collect())
    }

    /// Build from `(type, name)` pairs
    ///
    /// ```rust
    /// use mgmt_model::PathAddress;
    ///
    /// let address = PathAddress::from_pairs([("subsystem", "web"), ("connector", "http")]);
    /// assert_eq!(address.to_string(), "/subsystem=web/connector=http");
    /// ```
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| PathElement::new(k, v))
                .collect(),
        )
    }

    /// Segments from root to leaf
    #[inline]
    #[must_use]
    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    /// Number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the root address
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last segment, `None` for the root
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    /// Address with one segment appended
    #[must_use]
    pub fn child(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.0.push(PathElement::new(key, value));
        next
    }

    /// Address with the last segment removed
    ///
    /// # Errors
    /// [`AddressError::OutOfBounds`] on the root address.
    pub fn parent(&self) -> Result<Self, AddressError> {
        if self.0.is_empty() {
            return Err(AddressError::OutOfBounds);
        }
        Ok(Self(self.0[..self.0.len() - 1].iter().cloned().collect()))
    }

    /// Compose with an address relative to this one
    #[must_use]
    pub fn append(&self, relative: &PathAddress) -> Self {
        let mut next = self.clone();
        next.0.extend(relative.0.iter().cloned());
        next
    }

    /// Check if this address is a prefix of (or equal to) `other`
    #[inline]
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.0.len() <= other.0.len() && self.0[..] == other.0[..self.0.len()]
    }

    /// Strict prefix
    #[inline]
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.0.len() < other.0.len() && self.is_prefix_of(other)
    }

    /// Whether the two subtrees intersect (one address is a prefix of the other)
    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Address of `self` relative to `ancestor`
    ///
    /// # Errors
    /// Returns error if `self` is not inside `ancestor`'s subtree.
    pub fn relative_to(&self, ancestor: &Self) -> Result<Self, AddressError> {
        if !ancestor.is_prefix_of(self) {
            return Err(AddressError::NotDescendant {
                address: self.to_string(),
                ancestor: ancestor.to_string(),
            });
        }
        Ok(Self(self.0[ancestor.0.len()..].iter().cloned().collect()))
    }

    /// Segment-by-segment match against a registration pattern
    ///
    /// Lengths must agree; wildcard names in `pattern` match any name of the
    /// same type.
    #[must_use]
    pub fn matches(&self, pattern: &PathAddress) -> bool {
        self.0.len() == pattern.0.len()
            && self.0.iter().zip(pattern.0.iter()).all(|(e, p)| e.matches(p))
    }

    /// Number of non-wildcard segments; higher is more specific
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.0.iter().filter(|e| !e.is_wildcard()).count()
    }

    /// Whether any segment is a wildcard
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0.iter().any(PathElement::is_wildcard)
    }

    /// Iterator over segments
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }
}

impl Display for PathAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for element in &self.0 {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

impl FromStr for PathAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "/" {
            return Ok(Self::root());
        }
        let Some(body) = s.strip_prefix('/') else {
            return Err(AddressError::Malformed(s.to_string()));
        };

        let mut elements = SmallVec::new();
        for segment in split_unquoted(body, '/')? {
            let parts = split_unquoted(&segment, '=')?;
            let [key, value] = parts.as_slice() else {
                return Err(AddressError::Malformed(segment));
            };
            let key = unquote(key)?;
            let value = unquote(value)?;
            if key.is_empty() || value.is_empty() {
                return Err(AddressError::EmptySegment);
            }
            elements.push(PathElement { key, value });
        }
        Ok(Self(elements))
    }
}

impl TryFrom<String> for PathAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PathAddress> for String {
    fn from(address: PathAddress) -> Self {
        address.to_string()
    }
}

impl FromIterator<PathElement> for PathAddress {
    fn from_iter<I: IntoIterator<Item = PathElement>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty() || s.contains(['/', '=', '"'])
}

fn quote(s: &str) -> String {
    if needs_quotes(s) {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

fn unquote(s: &str) -> Result<String, AddressError> {
    match s.strip_prefix('"') {
        Some(inner) => inner
            .strip_suffix('"')
            .map(|v| v.replace("\\\"", "\""))
            .ok_or_else(|| AddressError::Malformed(s.to_string())),
        None => Ok(s.to_string()),
    }
}

/// Split on `sep` outside double quotes, keeping quotes in the pieces
fn split_unquoted(s: &str, sep: char) -> Result<Vec<String>, AddressError> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c == sep && !quoted => pieces.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if quoted {
        return Err(AddressError::Malformed(s.to_string()));
    }
    pieces.push(current);
    Ok(pieces)
}

/// Errors related to path addresses
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// `parent()` of the root address
    #[error("address is out of bounds: the root address has no parent")]
    OutOfBounds,

    /// Segment with empty type or name
    #[error("address contains an empty segment")]
    EmptySegment,

    /// Text that is not `/type=name/...`
    #[error("malformed address: {0}")]
    Malformed(String),

    /// Not a descendant address
    #[error("address '{address}' is not inside '{ancestor}'")]
    NotDescendant {
        /// Address being made relative
        address: String,
        /// Expected ancestor
        ancestor: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(s: &str) -> PathAddress {
        s.parse().unwrap()
    }

    #[test]
    fn root_display_and_parse() {
        assert_eq!(PathAddress::root().to_string(), "/");
        assert!(addr("/").is_empty());
        assert!(addr("").is_empty());
    }

    #[test]
    fn child_and_parent() {
        let a = PathAddress::root().child("subsystem", "foo").child("deployment", "bar");
        assert_eq!(a.to_string(), "/subsystem=foo/deployment=bar");
        assert_eq!(a.parent().unwrap(), addr("/subsystem=foo"));
        assert_eq!(a.last().unwrap().value(), "bar");
    }

    #[test]
    fn parent_of_root_is_out_of_bounds() {
        assert_eq!(PathAddress::root().parent(), Err(AddressError::OutOfBounds));
    }

    #[test]
    fn quoted_names_round_trip() {
        let a = PathAddress::from_pairs([
            ("subsystem", "resource-adapters"),
            ("connection-definitions", "java:/testMeRA"),
        ]);
        let text = a.to_string();
        assert_eq!(
            text,
            "/subsystem=resource-adapters/connection-definitions=\"java:/testMeRA\""
        );
        assert_eq!(addr(&text), a);
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(matches!("subsystem=foo".parse::<PathAddress>(), Err(AddressError::Malformed(_))));
        assert!(matches!("/subsystem".parse::<PathAddress>(), Err(AddressError::Malformed(_))));
        assert!(matches!("/a=\"b".parse::<PathAddress>(), Err(AddressError::Malformed(_))));
        assert_eq!("/a=".parse::<PathAddress>(), Err(AddressError::EmptySegment));
    }

    #[test]
    fn wildcard_matching() {
        let pattern = addr("/subsystem=web/connector=*");
        assert!(addr("/subsystem=web/connector=http").matches(&pattern));
        assert!(!addr("/subsystem=web/virtual-server=http").matches(&pattern));
        assert!(!addr("/subsystem=web").matches(&pattern));
        assert_eq!(pattern.specificity(), 1);
        assert!(pattern.is_wildcard());
    }

    #[test]
    fn prefix_relations() {
        let a = addr("/subsystem=foo");
        let b = addr("/subsystem=foo/deployment=bar");
        let c = addr("/subsystem=baz");
        assert!(a.is_prefix_of(&b));
        assert!(a.is_ancestor_of(&b));
        assert!(!a.is_ancestor_of(&a));
        assert!(a.overlaps(&b) && b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert_eq!(b.relative_to(&a).unwrap(), addr("/deployment=bar"));
        assert!(c.relative_to(&a).is_err());
        assert_eq!(a.append(&addr("/deployment=bar")), b);
    }

    #[test]
    fn serde_uses_text_form() {
        let a = addr("/subsystem=foo/deployment=bar");
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"/subsystem=foo/deployment=bar\"");
        let back: PathAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    fn arb_address() -> impl Strategy<Value = PathAddress> {
        prop::collection::vec(("[a-c]", "[x-z]"), 0..4).prop_map(PathAddress::from_pairs)
    }

    proptest! {
        #[test]
        fn prop_subtrees_are_contiguous(a in arb_address(), b in arb_address(), c in arb_address()) {
            // If a < b < c and a is a prefix of c, then a is a prefix of b.
            let mut v = [a, b, c];
            v.sort();
            if v[0].is_prefix_of(&v[2]) {
                prop_assert!(v[0].is_prefix_of(&v[1]));
            }
        }

        #[test]
        fn prop_parent_sorts_first(a in arb_address()) {
            if let Ok(parent) = a.parent() {
                prop_assert!(parent < a);
                prop_assert!(parent.is_ancestor_of(&a));
            }
        }

        #[test]
        fn prop_text_round_trip(a in arb_address()) {
            prop_assert_eq!(a.to_string().parse::<PathAddress>().unwrap(), a);
        }
    }
}
