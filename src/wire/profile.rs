//! Protocol profiles.
//!
//! A [`ProtocolProfile`] is an explicit value rather than ambient global
//! state: every encode/decode call takes one. [`with_profile`] exists only
//! to give the CLI a convenient scoped-default for call sites that don't
//! want to thread a profile through every layer.

use std::cell::RefCell;

/// Controls whether a response carries the path-size-words byte CIP
/// reserves in some vendor stacks. ODBA-strict omits it on responses;
/// legacy/vendor stacks often echo it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSizePolicy {
    NeverOnResponse,
    AlwaysPresent,
}

/// Whether SendRRData/SendUnitData always wrap a CPF container or may omit
/// it for degenerate single-item exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpfUsagePolicy {
    Always,
    Optional,
}

/// Width (in bytes) of the connection serial / sequence counter fields
/// that some vendor stacks widen from the ODVA-default 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCounterMode {
    Bits16,
    Bits32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipEndianness {
    Little,
    Big,
}

/// A named, fully explicit bundle of wire-format policy choices.
///
/// `ProtocolProfile` is `Copy` and cheap; callers pass it by value into the
/// codec rather than reading it from ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub name: &'static str,
    pub cip_endianness: CipEndianness,
    pub path_size_policy: PathSizePolicy,
    pub cpf_usage: CpfUsagePolicy,
    pub sequence_counter: SequenceCounterMode,
    /// Idle multiplier (× RPI) after which the server reaps a Class-1
    /// connection with no traffic. Tunable per profile, default 4.
    pub reaper_idle_rpi_multiplier: u32,
}

impl ProtocolProfile {
    pub const fn strict_odva() -> Self {
        ProtocolProfile {
            name: "strict_odva",
            cip_endianness: CipEndianness::Little,
            path_size_policy: PathSizePolicy::NeverOnResponse,
            cpf_usage: CpfUsagePolicy::Always,
            sequence_counter: SequenceCounterMode::Bits16,
            reaper_idle_rpi_multiplier: 4,
        }
    }

    pub const fn legacy_compat() -> Self {
        ProtocolProfile {
            name: "legacy_compat",
            cip_endianness: CipEndianness::Little,
            // Open Question resolution: legacy_compat defaults to
            // echoing the path-size byte on responses.
            path_size_policy: PathSizePolicy::AlwaysPresent,
            cpf_usage: CpfUsagePolicy::Optional,
            sequence_counter: SequenceCounterMode::Bits16,
            reaper_idle_rpi_multiplier: 4,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "strict_odva" => Some(Self::strict_odva()),
            "legacy_compat" => Some(Self::legacy_compat()),
            _ => None,
        }
    }
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self::strict_odva()
    }
}

thread_local! {
    static CURRENT: RefCell<ProtocolProfile> = RefCell::new(ProtocolProfile::strict_odva());
}

/// Returns the thread-local default profile, used by call sites (mainly
/// the CLI) that haven't threaded one through explicitly.
pub fn current_profile() -> ProtocolProfile {
    CURRENT.with(|c| *c.borrow())
}

/// Runs `f` with `profile` installed as the thread-local default, restoring
/// the previous profile afterward even if `f` panics or returns early.
pub fn with_profile<F, T>(profile: ProtocolProfile, f: F) -> T
where
    F: FnOnce() -> T,
{
    let previous = CURRENT.with(|c| {
        let previous = *c.borrow();
        *c.borrow_mut() = profile;
        previous
    });
    struct Restore(ProtocolProfile);
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT.with(|c| *c.borrow_mut() = self.0);
        }
    }
    let _restore = Restore(previous);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_profile_restores_previous_on_exit() {
        assert_eq!(current_profile().name, "strict_odva");
        with_profile(ProtocolProfile::legacy_compat(), || {
            assert_eq!(current_profile().name, "legacy_compat");
        });
        assert_eq!(current_profile().name, "strict_odva");
    }
}
