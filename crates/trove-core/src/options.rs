//! Operation options and their negotiation against [`Caps`].
//!
//! [`OperationOptions`] records which fields the caller actually set; an
//! unset field reads as its default. [`OperationOptions::obey_caps`] splits a
//! request into the part a source supports and the part it does not:
//! `skip`, `count`, `flags` and `type_filter` move as whole fields, key
//! filters move one key at a time.

use std::collections::BTreeMap;
use std::num::NonZeroU32;

use crate::caps::{Caps, CapsOption, ResolutionFlags, TypeFilter};
use crate::ids::KeyId;
use crate::media::Media;
use crate::value::{KeyFilter, Value};

/// Upper bound on the number of items a call may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Count {
    #[default]
    Unbounded,
    Limit(NonZeroU32),
}

impl Count {
    /// A positive limit; `None` for zero.
    pub fn limit(n: u32) -> Option<Count> {
        NonZeroU32::new(n).map(Count::Limit)
    }

    pub fn as_limit(self) -> Option<u32> {
        match self {
            Count::Unbounded => None,
            Count::Limit(n) => Some(n.get()),
        }
    }

    pub fn is_unbounded(self) -> bool {
        matches!(self, Count::Unbounded)
    }
}

/// The negotiable fields of [`OperationOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionField {
    Skip,
    Count,
    Flags,
    TypeFilter,
    KeyFilters,
}

/// What the dispatcher does with options a source does not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Negotiation {
    /// Refuse to start the operation.
    #[default]
    Strict,
    /// Drop unsupported fields and run with the rest.
    ///
    /// An unsupported skip, type filter or key filter is ignored, not
    /// emulated, so the results may include items it would have removed.
    /// `count` is still enforced by the dispatcher.
    Partial,
    /// Apply unsupported fields locally on the delivered items.
    Emulate,
}

/// Result of [`OperationOptions::obey_caps`].
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub fully_supported: bool,
    pub supported: OperationOptions,
    pub unsupported: OperationOptions,
}

// ---------------------------------------------------------------------------
// OperationOptions
// ---------------------------------------------------------------------------

/// Caller-supplied request parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOptions {
    skip: Option<u32>,
    count: Option<Count>,
    flags: Option<ResolutionFlags>,
    type_filter: Option<TypeFilter>,
    key_filters: BTreeMap<KeyId, KeyFilter>,
    caps: Option<Caps>,
    negotiation: Negotiation,
}

impl OperationOptions {
    /// Options with every field at its default, accepting any value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options whose setters refuse values outside `caps`.
    pub fn with_caps(caps: Caps) -> Self {
        Self {
            caps: Some(caps),
            ..Self::default()
        }
    }

    pub fn caps(&self) -> Option<&Caps> {
        self.caps.as_ref()
    }

    fn allows(&self, option: CapsOption<'_>) -> bool {
        self.caps.as_ref().map_or(true, |caps| caps.test(option))
    }

    // -- Setters -------------------------------------------------------------

    /// Set the number of leading results to omit. Returns `false` if the
    /// bound caps reject it.
    pub fn set_skip(&mut self, skip: u32) -> bool {
        if !self.allows(CapsOption::Skip(skip)) {
            return false;
        }
        self.skip = Some(skip);
        true
    }

    /// Set a positive upper bound on delivered items. Zero is rejected.
    pub fn set_count(&mut self, count: u32) -> bool {
        match Count::limit(count) {
            Some(count) => self.set_count_value(count),
            None => false,
        }
    }

    pub fn set_count_unbounded(&mut self) -> bool {
        self.set_count_value(Count::Unbounded)
    }

    fn set_count_value(&mut self, count: Count) -> bool {
        if !self.allows(CapsOption::Count(count)) {
            return false;
        }
        self.count = Some(count);
        true
    }

    pub fn set_flags(&mut self, flags: ResolutionFlags) -> bool {
        if !self.allows(CapsOption::Flags(flags)) {
            return false;
        }
        self.flags = Some(flags);
        true
    }

    pub fn set_type_filter(&mut self, filter: TypeFilter) -> bool {
        if !self.allows(CapsOption::TypeFilter(filter)) {
            return false;
        }
        self.type_filter = Some(filter);
        true
    }

    /// Require `key` to hold exactly `value`.
    pub fn set_key_filter(&mut self, key: KeyId, value: impl Into<Value>) -> bool {
        self.insert_key_filter(key, KeyFilter::Exact(value.into()))
    }

    /// Require `key` to lie within the inclusive bounds.
    pub fn set_key_range_filter(
        &mut self,
        key: KeyId,
        min: Option<Value>,
        max: Option<Value>,
    ) -> bool {
        self.insert_key_filter(key, KeyFilter::Range { min, max })
    }

    fn insert_key_filter(&mut self, key: KeyId, filter: KeyFilter) -> bool {
        if !key.is_valid() || !self.allows(CapsOption::KeyFilter(key, &filter)) {
            return false;
        }
        self.key_filters.insert(key, filter);
        true
    }

    pub fn remove_key_filter(&mut self, key: KeyId) -> Option<KeyFilter> {
        self.key_filters.remove(&key)
    }

    pub fn set_negotiation(&mut self, negotiation: Negotiation) {
        self.negotiation = negotiation;
    }

    /// Return `field` to its unset default.
    pub fn clear(&mut self, field: OptionField) {
        match field {
            OptionField::Skip => self.skip = None,
            OptionField::Count => self.count = None,
            OptionField::Flags => self.flags = None,
            OptionField::TypeFilter => self.type_filter = None,
            OptionField::KeyFilters => self.key_filters.clear(),
        }
    }

    // -- Builders ------------------------------------------------------------

    pub fn with_skip(mut self, skip: u32) -> Self {
        if !self.set_skip(skip) {
            tracing::debug!(skip, "skip rejected by bound caps");
        }
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        if !self.set_count(count) {
            tracing::debug!(count, "count rejected");
        }
        self
    }

    pub fn with_flags(mut self, flags: ResolutionFlags) -> Self {
        if !self.set_flags(flags) {
            tracing::debug!(?flags, "flags rejected by bound caps");
        }
        self
    }

    pub fn with_type_filter(mut self, filter: TypeFilter) -> Self {
        if !self.set_type_filter(filter) {
            tracing::debug!(?filter, "type filter rejected by bound caps");
        }
        self
    }

    pub fn with_key_filter(mut self, key: KeyId, value: impl Into<Value>) -> Self {
        if !self.set_key_filter(key, value) {
            tracing::debug!(key = %key, "key filter rejected");
        }
        self
    }

    pub fn with_key_range_filter(
        mut self,
        key: KeyId,
        min: Option<Value>,
        max: Option<Value>,
    ) -> Self {
        if !self.set_key_range_filter(key, min, max) {
            tracing::debug!(key = %key, "key range filter rejected");
        }
        self
    }

    pub fn with_negotiation(mut self, negotiation: Negotiation) -> Self {
        self.negotiation = negotiation;
        self
    }

    // -- Getters -------------------------------------------------------------

    pub fn skip(&self) -> u32 {
        self.skip.unwrap_or(0)
    }

    pub fn count(&self) -> Count {
        self.count.unwrap_or_default()
    }

    pub fn flags(&self) -> ResolutionFlags {
        self.flags.unwrap_or(ResolutionFlags::NORMAL)
    }

    pub fn type_filter(&self) -> TypeFilter {
        self.type_filter.unwrap_or(TypeFilter::ALL)
    }

    pub fn key_filter(&self, key: KeyId) -> Option<&KeyFilter> {
        self.key_filters.get(&key)
    }

    pub fn key_filters(&self) -> &BTreeMap<KeyId, KeyFilter> {
        &self.key_filters
    }

    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    /// Whether the caller set `field` explicitly.
    pub fn is_set(&self, field: OptionField) -> bool {
        match field {
            OptionField::Skip => self.skip.is_some(),
            OptionField::Count => self.count.is_some(),
            OptionField::Flags => self.flags.is_some(),
            OptionField::TypeFilter => self.type_filter.is_some(),
            OptionField::KeyFilters => !self.key_filters.is_empty(),
        }
    }

    /// True when no negotiable field is set.
    pub fn is_empty(&self) -> bool {
        [
            OptionField::Skip,
            OptionField::Count,
            OptionField::Flags,
            OptionField::TypeFilter,
            OptionField::KeyFilters,
        ]
        .into_iter()
        .all(|field| !self.is_set(field))
    }

    // -- Negotiation ---------------------------------------------------------

    /// Split these options into the parts `caps` does and does not support.
    ///
    /// Unset fields stay unset on both sides. Neither output is bound to a
    /// `Caps`; both keep the negotiation mode of `self`.
    pub fn obey_caps(&self, caps: &Caps) -> Negotiated {
        let mut supported = OperationOptions::new().with_negotiation(self.negotiation);
        let mut unsupported = OperationOptions::new().with_negotiation(self.negotiation);

        if let Some(skip) = self.skip {
            let side = pick(caps.test(CapsOption::Skip(skip)), &mut supported, &mut unsupported);
            side.skip = Some(skip);
        }
        if let Some(count) = self.count {
            let side = pick(caps.test(CapsOption::Count(count)), &mut supported, &mut unsupported);
            side.count = Some(count);
        }
        if let Some(flags) = self.flags {
            let side = pick(caps.test(CapsOption::Flags(flags)), &mut supported, &mut unsupported);
            side.flags = Some(flags);
        }
        if let Some(filter) = self.type_filter {
            let side = pick(
                caps.test(CapsOption::TypeFilter(filter)),
                &mut supported,
                &mut unsupported,
            );
            side.type_filter = Some(filter);
        }
        for (key, filter) in &self.key_filters {
            let side = pick(caps.key_filter_is_allowed(*key), &mut supported, &mut unsupported);
            side.key_filters.insert(*key, filter.clone());
        }

        Negotiated {
            fully_supported: unsupported.is_empty(),
            supported,
            unsupported,
        }
    }

    /// Whether `media` passes the type filter and every key filter.
    pub fn matches(&self, media: &Media) -> bool {
        if let Some(filter) = self.type_filter {
            if !media.kind().passes(filter) {
                return false;
            }
        }
        self.key_filters
            .iter()
            .all(|(key, filter)| filter.matches(media.get(*key)))
    }
}

fn pick<'a>(
    supported: bool,
    yes: &'a mut OperationOptions,
    no: &'a mut OperationOptions,
) -> &'a mut OperationOptions {
    if supported {
        yes
    } else {
        no
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::system;
    use proptest::prelude::*;

    #[test]
    fn defaults() {
        let options = OperationOptions::new();
        assert_eq!(options.skip(), 0);
        assert_eq!(options.count(), Count::Unbounded);
        assert_eq!(options.flags(), ResolutionFlags::NORMAL);
        assert_eq!(options.type_filter(), TypeFilter::ALL);
        assert!(options.is_empty());
    }

    #[test]
    fn setting_without_caps() {
        let mut options = OperationOptions::new();
        assert!(options.set_skip(12));
        assert!(options.set_count(28));
        assert!(options.set_flags(ResolutionFlags::FAST_ONLY | ResolutionFlags::IDLE_RELAY));
        assert_eq!(options.skip(), 12);
        assert_eq!(options.count().as_limit(), Some(28));
        assert!(options.flags().contains(ResolutionFlags::IDLE_RELAY));
        assert!(!options.set_count(0));
        assert_eq!(options.count().as_limit(), Some(28));
    }

    #[test]
    fn setters_respect_bound_caps() {
        let caps = Caps::new()
            .with_type_filter(TypeFilter::VIDEO)
            .with_key_filters([system::ARTIST]);
        let mut options = OperationOptions::with_caps(caps);
        assert!(!options.set_skip(5));
        assert!(!options.is_set(OptionField::Skip));
        assert!(options.set_type_filter(TypeFilter::VIDEO));
        assert!(!options.set_type_filter(TypeFilter::AUDIO | TypeFilter::VIDEO));
        assert_eq!(options.type_filter(), TypeFilter::VIDEO);
        assert!(options.set_key_filter(system::ARTIST, "Nina Simone"));
        assert!(!options.set_key_filter(system::ALBUM, "Pastel Blues"));
        assert!(!options.set_key_filter(KeyId::INVALID, "x"));
    }

    #[test]
    fn key_filter_negotiation_is_per_key() {
        let options = OperationOptions::new()
            .with_key_filter(system::ARTIST, "Nina Simone")
            .with_key_filter(system::ALBUM, "Pastel Blues")
            .with_key_range_filter(system::CREATION_DATE, None, None);
        let caps = Caps::new().with_key_filters([system::ARTIST, system::CREATION_DATE]);

        let result = options.obey_caps(&caps);
        assert!(!result.fully_supported);
        let supported: Vec<_> = result.supported.key_filters().keys().copied().collect();
        let unsupported: Vec<_> = result.unsupported.key_filters().keys().copied().collect();
        assert_eq!(supported, vec![system::ARTIST, system::CREATION_DATE]);
        assert_eq!(unsupported, vec![system::ALBUM]);
        assert_eq!(
            result.supported.key_filter(system::ARTIST),
            Some(&KeyFilter::Exact(Value::from("Nina Simone")))
        );
    }

    #[test]
    fn type_filter_moves_whole() {
        let caps = Caps::new().with_type_filter(TypeFilter::VIDEO);
        let ok = OperationOptions::new().with_type_filter(TypeFilter::VIDEO).obey_caps(&caps);
        assert!(ok.fully_supported);
        assert_eq!(ok.supported.type_filter(), TypeFilter::VIDEO);

        let mixed = OperationOptions::new()
            .with_type_filter(TypeFilter::AUDIO | TypeFilter::VIDEO)
            .obey_caps(&caps);
        assert!(!mixed.fully_supported);
        assert!(!mixed.supported.is_set(OptionField::TypeFilter));
        assert_eq!(mixed.unsupported.type_filter(), TypeFilter::AUDIO | TypeFilter::VIDEO);
    }

    #[test]
    fn empty_options_are_fully_supported_by_empty_caps() {
        let result = OperationOptions::new().obey_caps(&Caps::new());
        assert!(result.fully_supported);
        assert!(result.supported.is_empty());
    }

    #[test]
    fn pagination_moves_as_a_pair_of_whole_fields() {
        let options = OperationOptions::new().with_skip(2).with_count(3);
        let with = options.obey_caps(&Caps::new().with_pagination(true));
        assert!(with.fully_supported);
        assert_eq!(with.supported.skip(), 2);

        let without = options.obey_caps(&Caps::new());
        assert_eq!(without.unsupported.skip(), 2);
        assert_eq!(without.unsupported.count().as_limit(), Some(3));
        assert!(!without.supported.is_set(OptionField::Skip));
    }

    #[test]
    fn matches_checks_type_and_keys() {
        let song = Media::audio().with(system::ARTIST, "Nina Simone");
        let options = OperationOptions::new()
            .with_type_filter(TypeFilter::AUDIO)
            .with_key_filter(system::ARTIST, "Nina Simone");
        assert!(options.matches(&song));
        assert!(!options.matches(&Media::video().with(system::ARTIST, "Nina Simone")));
        assert!(!options.matches(&Media::audio()));
    }

    // -- Properties ----------------------------------------------------------

    fn arb_type_filter() -> impl Strategy<Value = TypeFilter> {
        (0u8..16).prop_map(TypeFilter::from_bits_truncate)
    }

    fn arb_options() -> impl Strategy<Value = OperationOptions> {
        (
            proptest::option::of(0u32..50),
            proptest::option::of(0u32..50),
            proptest::option::of((0u8..8).prop_map(ResolutionFlags::from_bits_truncate)),
            proptest::option::of(arb_type_filter()),
            proptest::collection::btree_set(1u32..12, 0..6),
        )
            .prop_map(|(skip, count, flags, type_filter, keys)| {
                let mut options = OperationOptions::new();
                if let Some(skip) = skip {
                    options.set_skip(skip);
                }
                if let Some(count) = count {
                    if !options.set_count(count) {
                        options.set_count_unbounded();
                    }
                }
                if let Some(flags) = flags {
                    options.set_flags(flags);
                }
                if let Some(filter) = type_filter {
                    options.set_type_filter(filter);
                }
                for key in keys {
                    options.set_key_filter(KeyId::from_raw(key), key as i64);
                }
                options
            })
    }

    fn arb_caps() -> impl Strategy<Value = Caps> {
        (
            any::<bool>(),
            any::<bool>(),
            arb_type_filter(),
            proptest::collection::btree_set(1u32..12, 0..6),
        )
            .prop_map(|(pagination, flags, type_filter, keys)| {
                Caps::new()
                    .with_pagination(pagination)
                    .with_flags(flags)
                    .with_type_filter(type_filter)
                    .with_key_filters(keys.into_iter().map(KeyId::from_raw))
            })
    }

    proptest! {
        #[test]
        fn negotiation_is_total(options in arb_options(), caps in arb_caps()) {
            let result = options.obey_caps(&caps);
            for field in [OptionField::Skip, OptionField::Count, OptionField::Flags, OptionField::TypeFilter] {
                let on_supported = result.supported.is_set(field);
                let on_unsupported = result.unsupported.is_set(field);
                prop_assert_eq!(options.is_set(field), on_supported || on_unsupported);
                prop_assert!(!(on_supported && on_unsupported));
            }
            let total = result.supported.key_filters().len() + result.unsupported.key_filters().len();
            prop_assert_eq!(total, options.key_filters().len());
            prop_assert_eq!(result.fully_supported, result.unsupported.is_empty());
        }
    }
}
