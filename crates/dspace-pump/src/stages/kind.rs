//! Entity kinds and their sub-phases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One importable entity kind. Declaration order is the import order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Groups,
    Handles,
    MetadataSchema,
    Communities,
    Collections,
    Registrations,
    EpersonGroups,
    People,
    Licenses,
    Items,
    Bundles,
    Bitstreams,
    UserMetadata,
    ResourcePolicies,
    Sequences,
}

impl StageKind {
    /// Every kind in dependency order.
    pub const ALL: [StageKind; 15] = [
        StageKind::Groups,
        StageKind::Handles,
        StageKind::MetadataSchema,
        StageKind::Communities,
        StageKind::Collections,
        StageKind::Registrations,
        StageKind::EpersonGroups,
        StageKind::People,
        StageKind::Licenses,
        StageKind::Items,
        StageKind::Bundles,
        StageKind::Bitstreams,
        StageKind::UserMetadata,
        StageKind::ResourcePolicies,
        StageKind::Sequences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Groups => "groups",
            StageKind::Handles => "handles",
            StageKind::MetadataSchema => "metadata_schema",
            StageKind::Communities => "communities",
            StageKind::Collections => "collections",
            StageKind::Registrations => "registrations",
            StageKind::EpersonGroups => "eperson_groups",
            StageKind::People => "people",
            StageKind::Licenses => "licenses",
            StageKind::Items => "items",
            StageKind::Bundles => "bundles",
            StageKind::Bitstreams => "bitstreams",
            StageKind::UserMetadata => "user_metadata",
            StageKind::ResourcePolicies => "resource_policies",
            StageKind::Sequences => "sequences",
        }
    }

    /// Sub-phases in execution order.
    pub fn phases(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            StageKind::Groups => &[Existing],
            StageKind::Handles => &[External, Objectless],
            StageKind::MetadataSchema => &[Schemas, Fields],
            StageKind::Communities => &[Communities, AdminGroups],
            StageKind::Collections => &[Collections, CollectionGroups],
            StageKind::Registrations => &[Import],
            StageKind::EpersonGroups => &[Groups, Subgroups],
            StageKind::People => &[People, UserRegistrations, Memberships],
            StageKind::Licenses => &[Labels, Licenses],
            StageKind::Items => &[Workspace, Workflow, Install, CollectionMapping, Versions],
            StageKind::Bundles => &[Import],
            StageKind::Bitstreams => &[Formats, Import, Logos, Checksums],
            StageKind::UserMetadata => &[Import],
            StageKind::ResourcePolicies => &[Purge, Import],
            StageKind::Sequences => &[Sync],
        }
    }

    /// Position in the import order.
    pub fn rank(&self) -> usize {
        Self::ALL.iter().position(|k| k == self).unwrap_or(usize::MAX)
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sub-phase of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Existing,
    External,
    Objectless,
    Schemas,
    Fields,
    Communities,
    AdminGroups,
    Collections,
    CollectionGroups,
    Import,
    Groups,
    Subgroups,
    People,
    UserRegistrations,
    Memberships,
    Labels,
    Licenses,
    Workspace,
    Workflow,
    Install,
    CollectionMapping,
    Versions,
    Formats,
    Logos,
    Checksums,
    Purge,
    Sync,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Existing => "existing",
            Phase::External => "external",
            Phase::Objectless => "objectless",
            Phase::Schemas => "schemas",
            Phase::Fields => "fields",
            Phase::Communities => "communities",
            Phase::AdminGroups => "admin_groups",
            Phase::Collections => "collections",
            Phase::CollectionGroups => "collection_groups",
            Phase::Import => "import",
            Phase::Groups => "groups",
            Phase::Subgroups => "subgroups",
            Phase::People => "people",
            Phase::UserRegistrations => "user_registrations",
            Phase::Memberships => "memberships",
            Phase::Labels => "labels",
            Phase::Licenses => "licenses",
            Phase::Workspace => "workspace",
            Phase::Workflow => "workflow",
            Phase::Install => "install",
            Phase::CollectionMapping => "collection_mapping",
            Phase::Versions => "versions",
            Phase::Formats => "formats",
            Phase::Logos => "logos",
            Phase::Checksums => "checksums",
            Phase::Purge => "purge",
            Phase::Sync => "sync",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
