//! Environment manifests and the compatibility check run on every new peer.

use crate::protocol::CompatibilityReply;
use colonysync_core::config::CompatibilityConfig;
use std::collections::BTreeMap;

/// One installed mod.
#[derive(Debug, Clone, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct ModEntry {
    /// Stable mod identifier.
    pub id: String,
    /// Version string, compared verbatim.
    pub version: String,
}

impl ModEntry {
    /// Convenience constructor.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

/// Game build plus installed mods on one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvironmentManifest {
    /// Game build identifier.
    pub game_version: String,
    /// Installed mods in load order.
    pub mods: Vec<ModEntry>,
}

impl EnvironmentManifest {
    /// Manifest with no mods.
    pub fn new(game_version: impl Into<String>) -> Self {
        Self {
            game_version: game_version.into(),
            mods: Vec::new(),
        }
    }

    /// Builder-style mod addition.
    pub fn with_mod(mut self, id: impl Into<String>, version: impl Into<String>) -> Self {
        self.mods.push(ModEntry::new(id, version));
        self
    }

    /// Stable fingerprint independent of mod load order.
    ///
    /// Hashes `mods|<ids>:versions|<versions>:gameVersion` with ids sorted,
    /// truncated to 64 bits.
    pub fn hash(&self) -> u64 {
        let mut sorted: Vec<&ModEntry> = self.mods.iter().collect();
        sorted.sort();

        let ids: Vec<&str> = sorted.iter().map(|m| m.id.as_str()).collect();
        let versions: Vec<&str> = sorted.iter().map(|m| m.version.as_str()).collect();
        let canonical = format!(
            "mods|{}:versions|{}:{}",
            ids.join("|"),
            versions.join("|"),
            self.game_version
        );

        let hash = blake3::hash(canonical.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(prefix)
    }

    fn by_id(&self) -> BTreeMap<&str, &str> {
        self.mods
            .iter()
            .map(|m| (m.id.as_str(), m.version.as_str()))
            .collect()
    }
}

/// Outcome of comparing a peer manifest against the host's.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompatibilityVerdict {
    /// Whether the peer may receive the world.
    pub compatible: bool,
    /// Host mods the peer lacks.
    pub missing: Vec<String>,
    /// Mods installed on both sides at different versions.
    pub mismatched: Vec<String>,
    /// Peer mods the host lacks.
    pub extra: Vec<String>,
    /// Differences tolerated by policy.
    pub warnings: Vec<String>,
    /// One-line summary.
    pub reason: String,
}

impl CompatibilityVerdict {
    /// Wire form sent back to the host.
    pub fn to_reply(&self) -> CompatibilityReply {
        CompatibilityReply {
            compatible: self.compatible,
            reason: self.reason.clone(),
            missing: self.missing.clone(),
            mismatched: self.mismatched.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// Compare `peer` against `host` under `policy`.
///
/// The game version must match and every host mod must be present. Version
/// mismatches and extra peer mods are errors unless the policy allows them.
pub fn check_compatibility(
    host: &EnvironmentManifest,
    peer: &EnvironmentManifest,
    policy: &CompatibilityConfig,
) -> CompatibilityVerdict {
    if !policy.enabled {
        return CompatibilityVerdict {
            compatible: true,
            reason: "compatibility checks disabled".to_string(),
            ..Default::default()
        };
    }

    let host_mods = host.by_id();
    let peer_mods = peer.by_id();
    let mut verdict = CompatibilityVerdict::default();
    let mut errors = Vec::new();

    if host.game_version != peer.game_version {
        errors.push(format!(
            "game version {} does not match host {}",
            peer.game_version, host.game_version
        ));
    }

    for (id, host_version) in &host_mods {
        match peer_mods.get(id) {
            None => verdict.missing.push((*id).to_string()),
            Some(peer_version) if peer_version != host_version => {
                verdict
                    .mismatched
                    .push(format!("{id} ({peer_version} vs host {host_version})"));
            }
            Some(_) => {}
        }
    }
    verdict.extra = peer_mods
        .keys()
        .filter(|id| !host_mods.contains_key(*id))
        .map(|id| (*id).to_string())
        .collect();

    if !verdict.missing.is_empty() {
        errors.push(format!("missing {} mod(s)", verdict.missing.len()));
    }
    if !verdict.mismatched.is_empty() {
        let note = format!("{} mod version mismatch(es)", verdict.mismatched.len());
        if policy.allow_version_mismatches {
            verdict.warnings.push(note);
        } else {
            errors.push(note);
        }
    }
    if !verdict.extra.is_empty() {
        let note = format!("{} extra mod(s)", verdict.extra.len());
        if policy.allow_extra_mods {
            verdict.warnings.push(note);
        } else {
            errors.push(note);
        }
    }

    verdict.compatible = errors.is_empty();
    verdict.reason = if verdict.compatible {
        "compatible".to_string()
    } else {
        errors.join("; ")
    };
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> EnvironmentManifest {
        EnvironmentManifest::new("U52-600112")
            .with_mod("colonysync", "1.0.0")
            .with_mod("better-pipes", "2.1")
    }

    #[test]
    fn test_hash_ignores_mod_order() {
        let a = host();
        let b = EnvironmentManifest::new("U52-600112")
            .with_mod("better-pipes", "2.1")
            .with_mod("colonysync", "1.0.0");
        assert_eq!(a.hash(), b.hash());

        let c = EnvironmentManifest::new("U52-600113")
            .with_mod("better-pipes", "2.1")
            .with_mod("colonysync", "1.0.0");
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_identical_manifests_compatible() {
        let verdict = check_compatibility(&host(), &host(), &CompatibilityConfig::default());
        assert!(verdict.compatible);
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn test_missing_mod_blocks() {
        let peer = EnvironmentManifest::new("U52-600112").with_mod("colonysync", "1.0.0");
        let verdict = check_compatibility(&host(), &peer, &CompatibilityConfig::default());
        assert!(!verdict.compatible);
        assert_eq!(verdict.missing, vec!["better-pipes".to_string()]);
    }

    #[test]
    fn test_version_mismatch_respects_policy() {
        let peer = EnvironmentManifest::new("U52-600112")
            .with_mod("colonysync", "1.0.0")
            .with_mod("better-pipes", "2.2");

        let strict = CompatibilityConfig::default();
        let verdict = check_compatibility(&host(), &peer, &strict);
        assert!(!verdict.compatible);
        assert_eq!(verdict.mismatched.len(), 1);

        let lenient = CompatibilityConfig {
            allow_version_mismatches: true,
            ..CompatibilityConfig::default()
        };
        let verdict = check_compatibility(&host(), &peer, &lenient);
        assert!(verdict.compatible);
        assert_eq!(verdict.warnings.len(), 1);
    }

    #[test]
    fn test_extra_mods_respect_policy() {
        let peer = host().with_mod("cheats", "0.1");
        let verdict = check_compatibility(&host(), &peer, &CompatibilityConfig::default());
        assert!(verdict.compatible);
        assert_eq!(verdict.extra, vec!["cheats".to_string()]);

        let strict = CompatibilityConfig {
            allow_extra_mods: false,
            ..CompatibilityConfig::default()
        };
        assert!(!check_compatibility(&host(), &peer, &strict).compatible);
    }

    #[test]
    fn test_game_version_must_match() {
        let mut peer = host();
        peer.game_version = "U51".to_string();
        let verdict = check_compatibility(&host(), &peer, &CompatibilityConfig::default());
        assert!(!verdict.compatible);
        assert!(verdict.reason.contains("game version"));
    }

    #[test]
    fn test_disabled_policy_accepts_anything() {
        let policy = CompatibilityConfig {
            enabled: false,
            ..CompatibilityConfig::default()
        };
        let verdict = check_compatibility(&host(), &EnvironmentManifest::default(), &policy);
        assert!(verdict.compatible);
    }
}
