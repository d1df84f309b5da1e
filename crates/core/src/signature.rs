//! Byte signatures
//!
//! A signature locates code without symbols: a byte pattern with wildcard
//! positions, scanned low-to-high inside a bounded range. The first full
//! match wins and the result (found or not) is cached for the life of the
//! signature, since the host image doesn't change under us.

use std::fmt;
use std::str::FromStr;

use crate::address::Address;
use crate::error::{EngineError, EngineResult};
use crate::memory::CodeMemory;

/// A byte pattern where `None` matches any byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern(Vec<Option<u8>>);

impl Pattern {
    /// Build a pattern, rejecting empty and all-wildcard ones
    pub fn new(bytes: Vec<Option<u8>>) -> EngineResult<Self> {
        if bytes.is_empty() {
            return Err(EngineError::InvalidPattern("Empty signature pattern".to_string()));
        }
        if bytes.iter().all(Option::is_none) {
            return Err(EngineError::InvalidPattern(
                "Signature pattern has no concrete bytes".to_string(),
            ));
        }
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[Option<u8>]) -> EngineResult<Self> {
        Self::new(bytes.to_vec())
    }

    /// Used by `pattern!`, which validates at compile time
    #[doc(hidden)]
    pub fn __from_checked(bytes: &[Option<u8>]) -> Self {
        Self(bytes.to_vec())
    }

    /// Parse a pattern string
    ///
    /// Supports:
    /// - Hex bytes: "55 48 89 E5"
    /// - Wildcards: "55 ? 89 E5" or "55 ?? 89 E5"
    pub fn parse(pattern: &str) -> EngineResult<Self> {
        let mut result = Vec::new();

        for part in pattern.split_whitespace() {
            if part == "?" || part == "??" {
                result.push(None);
            } else {
                let byte = u8::from_str_radix(part, 16).map_err(|_| {
                    EngineError::InvalidPattern(format!("Invalid hex byte: {}", part))
                })?;
                result.push(Some(byte));
            }
        }

        Self::new(result)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Option<u8>] {
        &self.0
    }

    /// Whether the pattern matches the start of `window`
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() >= self.0.len()
            && self
                .0
                .iter()
                .zip(window)
                .all(|(expected, actual)| expected.map_or(true, |b| b == *actual))
    }

    /// Offset of the first match at or after `start`
    pub fn find_from(&self, haystack: &[u8], start: usize) -> Option<usize> {
        if haystack.len() < self.0.len() {
            return None;
        }
        let last = haystack.len() - self.0.len();

        // Anchor on the first concrete byte to skip obvious misses
        let (anchor, anchor_byte) = self
            .0
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.map(|b| (i, b)))?;

        let mut offset = start;
        while offset <= last {
            let skip = haystack[offset + anchor..=last + anchor]
                .iter()
                .position(|&b| b == anchor_byte)?;
            offset += skip;
            if self.matches(&haystack[offset..]) {
                return Some(offset);
            }
            offset += 1;
        }
        None
    }

    /// Offset of the first match
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        self.find_from(haystack, 0)
    }
}

impl FromStr for Pattern {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match byte {
                Some(b) => write!(f, "{:02X}", b)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// How to treat a signature that matches more than once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Take the lowest match, ignore the rest
    #[default]
    FirstMatch,
    /// Fail with [`EngineError::AmbiguousMatch`] on a second match
    Unique,
}

/// Cached outcome of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Found(Address),
    NotFound,
    Ambiguous(Address, Address),
}

/// A named signature with optional search bounds and a cached result
#[derive(Debug, Clone)]
pub struct Signature {
    name: String,
    required: bool,
    pattern: Pattern,
    lowest: Option<Address>,
    highest: Option<Address>,
    resolution: Option<Resolution>,
}

impl Signature {
    pub fn new(name: impl Into<String>, required: bool, pattern: Pattern) -> Self {
        Self {
            name: name.into(),
            required,
            pattern,
            lowest: None,
            highest: None,
            resolution: None,
        }
    }

    /// Restrict the search to `[lowest, highest)`. Unset bounds use the
    /// engine's address range.
    pub fn bounded(mut self, lowest: Option<Address>, highest: Option<Address>) -> Self {
        self.lowest = lowest.filter(|a| !a.is_null());
        self.highest = highest.filter(|a| !a.is_null());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn lowest(&self) -> Option<Address> {
        self.lowest
    }

    pub fn highest(&self) -> Option<Address> {
        self.highest
    }

    /// Whether a search has already run
    pub fn already_tried(&self) -> bool {
        self.resolution.is_some()
    }

    /// The cached address, if the last search found one
    pub fn found_address(&self) -> Option<Address> {
        match self.resolution {
            Some(Resolution::Found(address)) => Some(address),
            _ => None,
        }
    }

    /// Forget the cached result so the next resolve scans again
    pub fn invalidate(&mut self) {
        self.resolution = None;
    }

    /// Resolve the signature, scanning only on the first call.
    ///
    /// `range` is the engine's effective `[lowest, highest)`; the signature's
    /// own bounds take precedence where set.
    pub fn resolve(
        &mut self,
        memory: &dyn CodeMemory,
        range: (Address, Address),
        policy: MatchPolicy,
    ) -> EngineResult<Address> {
        let resolution = match self.resolution {
            Some(resolution) => resolution,
            None => {
                let resolution = self.search(memory, range, policy);
                self.resolution = Some(resolution);
                resolution
            }
        };
        self.outcome(resolution)
    }

    /// Resolve, discarding any cached result first
    pub fn resolve_forced(
        &mut self,
        memory: &dyn CodeMemory,
        range: (Address, Address),
        policy: MatchPolicy,
    ) -> EngineResult<Address> {
        self.invalidate();
        self.resolve(memory, range, policy)
    }

    fn outcome(&self, resolution: Resolution) -> EngineResult<Address> {
        match resolution {
            Resolution::Found(address) => Ok(address),
            Resolution::NotFound => Err(EngineError::SignatureNotFound {
                name: self.name.clone(),
                required: self.required,
            }),
            Resolution::Ambiguous(first, second) => Err(EngineError::AmbiguousMatch {
                name: self.name.clone(),
                required: self.required,
                first,
                second,
            }),
        }
    }

    fn search(
        &self,
        memory: &dyn CodeMemory,
        range: (Address, Address),
        policy: MatchPolicy,
    ) -> Resolution {
        let lowest = self.lowest.unwrap_or(range.0);
        let highest = self.highest.unwrap_or(range.1);

        let Some(len) = lowest.distance_to(highest).filter(|&len| len > 0) else {
            tracing::warn!(
                "Signature '{}' has an empty search range {:#x}..{:#x}",
                self.name,
                lowest,
                highest
            );
            return Resolution::NotFound;
        };

        tracing::debug!(
            "Scanning for '{}' in {:#x}..{:#x} [{}]",
            self.name,
            lowest,
            highest,
            self.pattern
        );

        let haystack = match memory.read_vec(lowest, len) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Signature '{}' search range unreadable: {}", self.name, e);
                return Resolution::NotFound;
            }
        };

        let Some(first) = self.pattern.find(&haystack) else {
            if self.required {
                tracing::error!("Required signature '{}' not found", self.name);
            } else {
                tracing::warn!("Signature '{}' not found, feature disabled", self.name);
            }
            return Resolution::NotFound;
        };

        let address = Address::new(lowest.get() + first);

        if policy == MatchPolicy::Unique {
            if let Some(second) = self.pattern.find_from(&haystack, first + 1) {
                let second = Address::new(lowest.get() + second);
                tracing::error!(
                    "Signature '{}' is ambiguous: {:#x} and {:#x}",
                    self.name,
                    address,
                    second
                );
                return Resolution::Ambiguous(address, second);
            }
        }

        tracing::debug!("Signature '{}' found at {:#x}", self.name, address);
        Resolution::Found(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ImageMemory;

    const BASE: Address = Address::new(0x40_1000);

    fn image(bytes: &[u8]) -> ImageMemory {
        ImageMemory::new(BASE, bytes.to_vec())
    }

    fn full_range(memory: &ImageMemory) -> (Address, Address) {
        (memory.base(), memory.end())
    }

    #[test]
    fn test_parse_pattern() {
        let pattern = Pattern::parse("55 48 89 E5").unwrap();
        assert_eq!(
            pattern.as_slice(),
            &[Some(0x55), Some(0x48), Some(0x89), Some(0xE5)]
        );

        let pattern = Pattern::parse("55 ? 89 ??").unwrap();
        assert_eq!(pattern.as_slice(), &[Some(0x55), None, Some(0x89), None]);
        assert_eq!(pattern.to_string(), "55 ?? 89 ??");
    }

    #[test]
    fn test_reject_degenerate_patterns() {
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("?? ? ??").is_err());
        assert!(Pattern::parse("55 GG").is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        let pattern = Pattern::from_slice(&[Some(0x8B), None, Some(0x34)]).unwrap();
        assert_eq!(pattern.find(&[0x00, 0x8B, 0xAA, 0x34]), Some(1));
        assert_eq!(pattern.find(&[0x00, 0x8B, 0xAA, 0x35]), None);
    }

    #[test]
    fn test_wildcard_scenario_resolves_to_start() {
        let bytes = [0x83, 0xC4, 0x10, 0x85, 0xC0, 0x74, 0x05, 0x8B, 0x08, 0xA1];
        let memory = image(&bytes);
        let pattern = Pattern::parse("83 C4 10 85 C0 74 ? 8B 08").unwrap();
        let mut sig = Signature::new("hs_print", false, pattern);

        let found = sig
            .resolve(&memory, full_range(&memory), MatchPolicy::FirstMatch)
            .unwrap();
        assert_eq!(found, BASE);
    }

    #[test]
    fn test_first_match_wins() {
        let bytes = [0x90, 0x51, 0x53, 0x90, 0x51, 0x53];
        let memory = image(&bytes);
        let mut sig = Signature::new("dup", false, Pattern::parse("51 53").unwrap());

        let found = sig
            .resolve(&memory, full_range(&memory), MatchPolicy::FirstMatch)
            .unwrap();
        assert_eq!(found, Address::new(BASE.get() + 1));

        let mut strict = Signature::new("dup", true, Pattern::parse("51 53").unwrap());
        let err = strict
            .resolve(&memory, full_range(&memory), MatchPolicy::Unique)
            .unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousMatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bounds_enforced() {
        let bytes = [0x51, 0x53, 0x00, 0x00, 0x00, 0x00];
        let memory = image(&bytes);
        let mut sig = Signature::new("bounded", false, Pattern::parse("51 53").unwrap())
            .bounded(Some(Address::new(BASE.get() + 1)), None);

        let err = sig
            .resolve(&memory, full_range(&memory), MatchPolicy::FirstMatch)
            .unwrap_err();
        assert!(matches!(err, EngineError::SignatureNotFound { required: false, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_match_must_fit_below_highest() {
        let bytes = [0x00, 0x00, 0x51, 0x53];
        let memory = image(&bytes);
        let mut sig = Signature::new("tail", true, Pattern::parse("51 53").unwrap())
            .bounded(None, Some(Address::new(BASE.get() + 3)));

        let err = sig
            .resolve(&memory, full_range(&memory), MatchPolicy::FirstMatch)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_resolution_is_cached() {
        let memory = image(&[0x00, 0x51, 0x53]);
        let range = full_range(&memory);
        let mut sig = Signature::new("cached", false, Pattern::parse("51 53").unwrap());

        assert_eq!(
            sig.resolve(&memory, range, MatchPolicy::FirstMatch).unwrap(),
            Address::new(BASE.get() + 1)
        );

        // Memory changes are not seen until the cache is invalidated
        memory.write(BASE, &[0x51, 0x53, 0x00]).unwrap();
        assert_eq!(
            sig.resolve(&memory, range, MatchPolicy::FirstMatch).unwrap(),
            Address::new(BASE.get() + 1)
        );
        assert_eq!(
            sig.resolve_forced(&memory, range, MatchPolicy::FirstMatch)
                .unwrap(),
            BASE
        );
    }

    #[test]
    fn test_failed_search_is_cached() {
        let memory = image(&[0x00, 0x00]);
        let range = full_range(&memory);
        let mut sig = Signature::new("missing", false, Pattern::parse("51 53").unwrap());

        assert!(sig.resolve(&memory, range, MatchPolicy::FirstMatch).is_err());
        assert!(sig.already_tried());

        memory.write(BASE, &[0x51, 0x53]).unwrap();
        assert!(sig.resolve(&memory, range, MatchPolicy::FirstMatch).is_err());
        assert_eq!(sig.found_address(), None);
    }

    #[test]
    fn test_deterministic_across_instances() {
        let memory = image(&[0x11, 0x8B, 0x01, 0x34, 0x8B, 0x02, 0x34]);
        let range = full_range(&memory);
        let pattern = Pattern::parse("8B ?? 34").unwrap();

        let results: Vec<_> = (0..4)
            .map(|_| {
                Signature::new("stable", false, pattern.clone())
                    .resolve(&memory, range, MatchPolicy::FirstMatch)
                    .unwrap()
            })
            .collect();
        assert!(results.iter().all(|&a| a == Address::new(BASE.get() + 1)));
    }
}
