//! Device quirk policy resolver (C4, §4.4): a layered composition of
//! defaults, class heuristics, a static quirk database, a learned profile,
//! probed capabilities, and user overrides into one frozen [`DevicePolicy`].

use std::collections::BTreeMap;

use crate::config::UserOverrides;

/// `(vid, pid, bcd_device, bus, address)` plus optional string descriptors
/// (§3 `DeviceIdentity`). Immutable for the lifetime of a physical
/// attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub bus: u8,
    pub address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl DeviceIdentity {
    /// `"{vid:04x}:{pid:04x}@{bus}:{addr}"` (§3).
    pub fn device_id(&self) -> String {
        format!(
            "{:04x}:{:04x}@{}:{}",
            self.vendor_id, self.product_id, self.bus, self.address
        )
    }
}

/// Capability bits a device may or may not support (§3 `QuirkFlags`).
/// Conservative defaults: everything `false` except what a class heuristic
/// implies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuirkFlags {
    pub supports_get_object_prop_list: bool,
    pub supports_partial_read_64: bool,
    pub supports_partial_write: bool,
    pub requires_kernel_detach: bool,
    pub reset_on_open: bool,
    pub disable_event_pump: bool,
    pub needs_short_reads: bool,
    pub skip_ptp_reset: bool,
    pub requires_session_before_device_info: bool,
    pub needs_longer_open_timeout: bool,
}

/// Sparse overlay over [`QuirkFlags`]: `None` means "leave whatever the
/// lower layer set", `Some(v)` means "set to `v`".
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialFlags {
    pub supports_get_object_prop_list: Option<bool>,
    pub supports_partial_read_64: Option<bool>,
    pub supports_partial_write: Option<bool>,
    pub requires_kernel_detach: Option<bool>,
    pub reset_on_open: Option<bool>,
    pub disable_event_pump: Option<bool>,
    pub needs_short_reads: Option<bool>,
    pub skip_ptp_reset: Option<bool>,
    pub requires_session_before_device_info: Option<bool>,
    pub needs_longer_open_timeout: Option<bool>,
}

impl PartialFlags {
    fn apply(&self, base: &mut QuirkFlags, source: Source, sources: &mut BTreeMap<String, Source>) {
        macro_rules! merge {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    base.$field = v;
                    sources.insert(stringify!($field).to_string(), source);
                }
            };
        }
        merge!(supports_get_object_prop_list);
        merge!(supports_partial_read_64);
        merge!(supports_partial_write);
        merge!(requires_kernel_detach);
        merge!(reset_on_open);
        merge!(disable_event_pump);
        merge!(needs_short_reads);
        merge!(skip_ptp_reset);
        merge!(requires_session_before_device_info);
        merge!(needs_longer_open_timeout);
    }
}

/// Tuning values before bounds clamping (§3 `TuningProfile` bounds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningProfile {
    pub max_chunk_bytes: u32,
    pub io_timeout_ms: u32,
    pub handshake_timeout_ms: u32,
    pub inactivity_timeout_ms: u32,
    pub overall_deadline_ms: u32,
    pub stabilize_ms: u32,
    pub post_claim_stabilize_ms: u32,
}

impl Default for TuningProfile {
    fn default() -> Self {
        TuningProfile {
            max_chunk_bytes: 1 << 20, // 1 MiB
            io_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            inactivity_timeout_ms: 10_000,
            overall_deadline_ms: 30_000,
            stabilize_ms: 0,
            post_claim_stabilize_ms: 100,
        }
    }
}

pub mod bounds {
    pub const MAX_CHUNK_BYTES: std::ops::RangeInclusive<u32> = 4096..=16 * 1024 * 1024;
    pub const IO_TIMEOUT_MS: std::ops::RangeInclusive<u32> = 1_000..=120_000;
    pub const HANDSHAKE_TIMEOUT_MS: std::ops::RangeInclusive<u32> = 1_000..=60_000;
    pub const INACTIVITY_TIMEOUT_MS: std::ops::RangeInclusive<u32> = 1_000..=60_000;
    pub const OVERALL_DEADLINE_MS: std::ops::RangeInclusive<u32> = 1_000..=300_000;
    pub const STABILIZE_MS: std::ops::RangeInclusive<u32> = 0..=5_000;
    pub const POST_CLAIM_STABILIZE_MS: std::ops::RangeInclusive<u32> = 0..=1_000;
}

fn clamp(value: u32, range: std::ops::RangeInclusive<u32>) -> u32 {
    value.clamp(*range.start(), *range.end())
}

/// Rounds `value` down to the nearest power of two, then re-clamps into
/// `range` (§4.4: "rounded down to the nearest power of two within
/// bounds").
fn round_down_pow2_within(value: u32, range: std::ops::RangeInclusive<u32>) -> u32 {
    let clamped = clamp(value, range.clone());
    let pow2 = if clamped == 0 {
        *range.start()
    } else {
        1u32 << (31 - clamped.leading_zeros())
    };
    clamp(pow2, range)
}

/// Sparse overlay over [`TuningProfile`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialTuning {
    pub max_chunk_bytes: Option<u32>,
    pub io_timeout_ms: Option<u32>,
    pub handshake_timeout_ms: Option<u32>,
    pub inactivity_timeout_ms: Option<u32>,
    pub overall_deadline_ms: Option<u32>,
    pub stabilize_ms: Option<u32>,
    pub post_claim_stabilize_ms: Option<u32>,
}

impl PartialTuning {
    fn apply(&self, base: &mut TuningProfile, source: Source, sources: &mut PolicySources) {
        if let Some(v) = self.max_chunk_bytes {
            base.max_chunk_bytes = v;
            sources.chunk_size_source = source;
        }
        if let Some(v) = self.io_timeout_ms {
            base.io_timeout_ms = v;
            sources.io_timeout_source = source;
        }
        if let Some(v) = self.handshake_timeout_ms {
            base.handshake_timeout_ms = v;
            sources.handshake_timeout_source = source;
        }
        if let Some(v) = self.inactivity_timeout_ms {
            base.inactivity_timeout_ms = v;
            sources.inactivity_timeout_source = source;
        }
        if let Some(v) = self.overall_deadline_ms {
            base.overall_deadline_ms = v;
            sources.overall_deadline_source = source;
        }
        if let Some(v) = self.stabilize_ms {
            base.stabilize_ms = v;
            sources.stabilize_source = source;
        }
        if let Some(v) = self.post_claim_stabilize_ms {
            base.post_claim_stabilize_ms = v;
            sources.post_claim_stabilize_source = source;
        }
    }
}

/// Which strategy an operation should currently prefer (§3
/// `FallbackSelections`); the ladder (C7) still tries the remaining rungs
/// in order if the preferred one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationStrategy {
    PropList5,
    PropList3,
    HandlesThenInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Partial64,
    Partial32,
    WholeObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    Partial,
    WholeObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackSelections {
    pub enumeration: EnumerationStrategy,
    pub read: ReadStrategy,
    pub write: WriteStrategy,
}

impl Default for FallbackSelections {
    fn default() -> Self {
        FallbackSelections {
            enumeration: EnumerationStrategy::PropList5,
            read: ReadStrategy::Partial64,
            write: WriteStrategy::Partial,
        }
    }
}

/// Provenance of a resolved field (§3 `sources`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    Default,
    ClassHeuristic,
    Quirk,
    Learned,
    Probe,
    UserOverride,
}

/// Per-field provenance for every tuning value, plus a map for flags
/// (arbitrarily many, added to as quirks contribute them).
#[derive(Debug, Clone)]
pub struct PolicySources {
    pub chunk_size_source: Source,
    pub io_timeout_source: Source,
    pub handshake_timeout_source: Source,
    pub inactivity_timeout_source: Source,
    pub overall_deadline_source: Source,
    pub stabilize_source: Source,
    pub post_claim_stabilize_source: Source,
    pub flags: BTreeMap<String, Source>,
}

impl Default for PolicySources {
    fn default() -> Self {
        PolicySources {
            chunk_size_source: Source::Default,
            io_timeout_source: Source::Default,
            handshake_timeout_source: Source::Default,
            inactivity_timeout_source: Source::Default,
            overall_deadline_source: Source::Default,
            stabilize_source: Source::Default,
            post_claim_stabilize_source: Source::Default,
            flags: BTreeMap::new(),
        }
    }
}

/// A statically-known quirk database entry (§4.4 layer 3). The database's
/// *contents* are out of scope (spec.md §1); this is the resolver's view of
/// one entry and how specificity is computed.
#[derive(Debug, Clone, Default)]
pub struct QuirkEntry {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: Option<u16>,
    pub iface_class: Option<u8>,
    pub iface_subclass: Option<u8>,
    pub iface_protocol: Option<u8>,
    /// Substring match against the device's reported model/product string.
    /// A simplification of "device_info_regex" (§3): the quirk DB's match
    /// grammar is explicitly out of scope, and a substring check is
    /// sufficient to demonstrate specificity-based precedence without
    /// pulling in a regex engine the rest of the corpus never reaches for
    /// in this domain.
    pub device_info_pattern: Option<String>,
    pub flags: PartialFlags,
    pub tuning: PartialTuning,
}

impl QuirkEntry {
    /// `None` if this entry doesn't match; otherwise its specificity (count
    /// of non-wildcard fields that matched).
    fn specificity_if_matches(
        &self,
        identity: &DeviceIdentity,
        iface_class: u8,
        iface_subclass: u8,
        iface_protocol: u8,
        device_info_text: Option<&str>,
    ) -> Option<u32> {
        if self.vendor_id != identity.vendor_id || self.product_id != identity.product_id {
            return None;
        }
        let mut score = 2; // vid + pid always match to get here
        if let Some(bcd) = self.bcd_device {
            if bcd != identity.bcd_device {
                return None;
            }
            score += 1;
        }
        if let Some(c) = self.iface_class {
            if c != iface_class {
                return None;
            }
            score += 1;
        }
        if let Some(s) = self.iface_subclass {
            if s != iface_subclass {
                return None;
            }
            score += 1;
        }
        if let Some(p) = self.iface_protocol {
            if p != iface_protocol {
                return None;
            }
            score += 1;
        }
        if let Some(pattern) = &self.device_info_pattern {
            match device_info_text {
                Some(text) if text.contains(pattern.as_str()) => score += 1,
                _ => return None,
            }
        }
        Some(score)
    }
}

/// Observations made by the probe (C3) that feed back into policy (§4.4
/// layer 5).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbedCapabilities {
    pub supports_events: bool,
}

/// The frozen, fully-resolved policy a [`crate::link::Link`] consumes for
/// its whole lifetime (§3 `DevicePolicy`).
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    pub tuning: TuningProfile,
    pub flags: QuirkFlags,
    pub fallbacks: FallbackSelections,
    pub sources: PolicySources,
}

/// Composes all six layers into one [`DevicePolicy`] (§4.4). Deterministic:
/// identical inputs yield identical outputs (§8 property 4); no clock or
/// RNG consulted.
#[allow(clippy::too_many_arguments)]
pub fn build_policy(
    identity: &DeviceIdentity,
    iface_class: u8,
    iface_subclass: u8,
    iface_protocol: u8,
    quirk_db: &[QuirkEntry],
    device_info_text: Option<&str>,
    learned_profile: Option<PartialTuning>,
    probed: ProbedCapabilities,
    overrides: &UserOverrides,
) -> DevicePolicy {
    let mut tuning = TuningProfile::default();
    let mut flags = QuirkFlags::default();
    let mut sources = PolicySources::default();
    let mut flag_sources: BTreeMap<String, Source> = BTreeMap::new();

    // Layer 2: class heuristic.
    const PTP_STILL_IMAGE_CLASS: u8 = 0x06;
    if iface_class == PTP_STILL_IMAGE_CLASS {
        flags.supports_get_object_prop_list = true;
        flags.requires_kernel_detach = false;
        tuning.stabilize_ms = 0;
        flag_sources.insert("supports_get_object_prop_list".into(), Source::ClassHeuristic);
        flag_sources.insert("requires_kernel_detach".into(), Source::ClassHeuristic);
        sources.stabilize_source = Source::ClassHeuristic;
    }

    // Layer 3: static quirk match, most specific wins.
    let best_quirk = quirk_db
        .iter()
        .filter_map(|entry| {
            entry
                .specificity_if_matches(identity, iface_class, iface_subclass, iface_protocol, device_info_text)
                .map(|score| (score, entry))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, entry)| entry);
    if let Some(entry) = best_quirk {
        entry.flags.apply(&mut flags, Source::Quirk, &mut flag_sources);
        entry.tuning.apply(&mut tuning, Source::Quirk, &mut sources);
    }

    // Layer 4: learned profile, merges only if present.
    if let Some(learned) = learned_profile {
        learned.apply(&mut tuning, Source::Learned, &mut sources);
    }

    // Layer 5: probed capabilities.
    flags.disable_event_pump = flags.disable_event_pump || !probed.supports_events;
    flag_sources.insert("disable_event_pump".into(), Source::Probe);

    // Layer 6: user overrides, highest precedence.
    if let Some(v) = overrides.max_chunk_bytes {
        tuning.max_chunk_bytes = v;
        sources.chunk_size_source = Source::UserOverride;
    }
    if let Some(v) = overrides.io_timeout_ms {
        tuning.io_timeout_ms = v;
        sources.io_timeout_source = Source::UserOverride;
    }
    if let Some(v) = overrides.handshake_timeout_ms {
        tuning.handshake_timeout_ms = v;
        sources.handshake_timeout_source = Source::UserOverride;
    }
    if let Some(v) = overrides.inactivity_timeout_ms {
        tuning.inactivity_timeout_ms = v;
        sources.inactivity_timeout_source = Source::UserOverride;
    }
    if let Some(v) = overrides.overall_deadline_ms {
        tuning.overall_deadline_ms = v;
        sources.overall_deadline_source = Source::UserOverride;
    }
    if let Some(v) = overrides.stabilize_ms {
        tuning.stabilize_ms = v;
        sources.stabilize_source = Source::UserOverride;
    }

    let mut fallbacks = FallbackSelections::default();
    if overrides.disable_partial_read == Some(true) {
        fallbacks.read = ReadStrategy::WholeObject;
        flag_sources.insert("read_strategy".into(), Source::UserOverride);
    }
    if overrides.disable_partial_write == Some(true) {
        fallbacks.write = WriteStrategy::WholeObject;
        flag_sources.insert("write_strategy".into(), Source::UserOverride);
    }
    if !flags.supports_partial_read_64 && matches!(fallbacks.read, ReadStrategy::Partial64) {
        fallbacks.read = ReadStrategy::WholeObject;
    }
    if !flags.supports_partial_write && matches!(fallbacks.write, WriteStrategy::Partial) {
        fallbacks.write = WriteStrategy::WholeObject;
    }
    if !flags.supports_get_object_prop_list && matches!(fallbacks.enumeration, EnumerationStrategy::PropList5) {
        fallbacks.enumeration = EnumerationStrategy::HandlesThenInfo;
    }

    // Clamp after merge, not before (§4.4).
    tuning.max_chunk_bytes = round_down_pow2_within(tuning.max_chunk_bytes, bounds::MAX_CHUNK_BYTES);
    tuning.io_timeout_ms = clamp(tuning.io_timeout_ms, bounds::IO_TIMEOUT_MS);
    tuning.handshake_timeout_ms = clamp(tuning.handshake_timeout_ms, bounds::HANDSHAKE_TIMEOUT_MS);
    tuning.inactivity_timeout_ms = clamp(tuning.inactivity_timeout_ms, bounds::INACTIVITY_TIMEOUT_MS);
    tuning.overall_deadline_ms = clamp(tuning.overall_deadline_ms, bounds::OVERALL_DEADLINE_MS);
    tuning.stabilize_ms = clamp(tuning.stabilize_ms, bounds::STABILIZE_MS);
    tuning.post_claim_stabilize_ms = clamp(tuning.post_claim_stabilize_ms, bounds::POST_CLAIM_STABILIZE_MS);

    sources.flags = flag_sources;

    DevicePolicy {
        tuning,
        flags,
        fallbacks,
        sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: 0x18d1,
            product_id: 0x4ee1,
            bcd_device: 0x0100,
            bus: 1,
            address: 2,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn tuning_clamp_holds_for_extreme_inputs() {
        let overrides = UserOverrides {
            max_chunk_bytes: Some(u32::MAX),
            io_timeout_ms: Some(0),
            ..Default::default()
        };
        let policy = build_policy(
            &identity(),
            0x06,
            0x01,
            0x01,
            &[],
            None,
            None,
            ProbedCapabilities::default(),
            &overrides,
        );
        assert!(bounds::MAX_CHUNK_BYTES.contains(&policy.tuning.max_chunk_bytes));
        assert!(bounds::IO_TIMEOUT_MS.contains(&policy.tuning.io_timeout_ms));
        assert!(policy.tuning.max_chunk_bytes.is_power_of_two());
    }

    #[test]
    fn quirk_priority_override_wins() {
        let quirk = QuirkEntry {
            vendor_id: 0x18d1,
            product_id: 0x4ee1,
            tuning: PartialTuning {
                max_chunk_bytes: Some(8_388_608),
                ..Default::default()
            },
            ..Default::default()
        };
        let overrides = UserOverrides {
            max_chunk_bytes: Some(2_097_152),
            ..Default::default()
        };
        let policy = build_policy(
            &identity(),
            0x06,
            0x01,
            0x01,
            &[quirk],
            None,
            None,
            ProbedCapabilities::default(),
            &overrides,
        );
        assert_eq!(policy.tuning.max_chunk_bytes, 2_097_152);
        assert_eq!(policy.sources.chunk_size_source, Source::UserOverride);
    }

    #[test]
    fn most_specific_quirk_wins() {
        let generic = QuirkEntry {
            vendor_id: 0x18d1,
            product_id: 0x4ee1,
            tuning: PartialTuning {
                io_timeout_ms: Some(9000),
                ..Default::default()
            },
            ..Default::default()
        };
        let specific = QuirkEntry {
            vendor_id: 0x18d1,
            product_id: 0x4ee1,
            iface_class: Some(0x06),
            tuning: PartialTuning {
                io_timeout_ms: Some(4000),
                ..Default::default()
            },
            ..Default::default()
        };
        let policy = build_policy(
            &identity(),
            0x06,
            0x01,
            0x01,
            &[generic, specific],
            None,
            None,
            ProbedCapabilities::default(),
            &UserOverrides::default(),
        );
        assert_eq!(policy.tuning.io_timeout_ms, 4000);
    }

    #[test]
    fn determinism() {
        let a = build_policy(
            &identity(),
            0x06,
            0x01,
            0x01,
            &[],
            None,
            None,
            ProbedCapabilities { supports_events: true },
            &UserOverrides::default(),
        );
        let b = build_policy(
            &identity(),
            0x06,
            0x01,
            0x01,
            &[],
            None,
            None,
            ProbedCapabilities { supports_events: true },
            &UserOverrides::default(),
        );
        assert_eq!(a.tuning, b.tuning);
        assert_eq!(a.flags, b.flags);
    }

    #[test]
    fn device_id_format() {
        assert_eq!(identity().device_id(), "18d1:4ee1@1:2");
    }

    proptest::proptest! {
        #[test]
        fn prop_tuning_always_clamped(
            chunk: u32, io: u32, hs: u32, inact: u32, deadline: u32, stab: u32, post: u32,
        ) {
            let overrides = UserOverrides {
                max_chunk_bytes: Some(chunk),
                io_timeout_ms: Some(io),
                handshake_timeout_ms: Some(hs),
                inactivity_timeout_ms: Some(inact),
                overall_deadline_ms: Some(deadline),
                stabilize_ms: Some(stab),
                disable_partial_read: None,
                disable_partial_write: None,
            };
            let _ = post;
            let policy = build_policy(
                &identity(), 0x06, 0x01, 0x01, &[], None, None, ProbedCapabilities::default(), &overrides,
            );
            prop_assert!(bounds::MAX_CHUNK_BYTES.contains(&policy.tuning.max_chunk_bytes));
            prop_assert!(policy.tuning.max_chunk_bytes.is_power_of_two());
            prop_assert!(bounds::IO_TIMEOUT_MS.contains(&policy.tuning.io_timeout_ms));
            prop_assert!(bounds::HANDSHAKE_TIMEOUT_MS.contains(&policy.tuning.handshake_timeout_ms));
            prop_assert!(bounds::INACTIVITY_TIMEOUT_MS.contains(&policy.tuning.inactivity_timeout_ms));
            prop_assert!(bounds::OVERALL_DEADLINE_MS.contains(&policy.tuning.overall_deadline_ms));
            prop_assert!(bounds::STABILIZE_MS.contains(&policy.tuning.stabilize_ms));
        }
    }
}
