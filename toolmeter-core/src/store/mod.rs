//! Durable storage for spans and tool-profile rollups.
//!
//! A [`PersistUnit`] is everything one batch (or one proxied exchange)
//! writes: profile counter deltas plus the span rows that reference those
//! profiles. A store applies a unit atomically or not at all.

pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::attribution::Attribution;
use crate::error::CoreResult;
use crate::telemetry::{SpanDraft, Vendor};

pub use sqlite::SqliteStore;

/// Spans of one vendor within a unit.
#[derive(Debug, Clone)]
pub struct VendorGroup {
    pub vendor: Vendor,
    pub spans: Vec<SpanDraft>,
}

/// Additive counter changes for one `(tenant, vendor)` profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileDelta {
    pub spans: i64,
    pub traces: i64,
    pub errors: i64,
}

impl VendorGroup {
    pub fn delta(&self) -> ProfileDelta {
        let traces: HashSet<&str> = self.spans.iter().map(|s| s.trace_id.as_str()).collect();
        ProfileDelta {
            spans: self.spans.len() as i64,
            traces: traces.len() as i64,
            errors: self
                .spans
                .iter()
                .filter(|s| s.status_code.is_error())
                .count() as i64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistUnit {
    pub attribution: Attribution,
    groups: Vec<VendorGroup>,
}

impl PersistUnit {
    pub fn new(attribution: Attribution) -> Self {
        Self {
            attribution,
            groups: Vec::new(),
        }
    }

    /// Add spans under a vendor. Groups sharing a slug merge so each profile
    /// is upserted once per unit.
    pub fn push(&mut self, vendor: Vendor, spans: Vec<SpanDraft>) {
        if spans.is_empty() {
            return;
        }
        match self.groups.iter_mut().find(|g| g.vendor.slug == vendor.slug) {
            Some(group) => group.spans.extend(spans),
            None => self.groups.push(VendorGroup { vendor, spans }),
        }
    }

    pub fn groups(&self) -> &[VendorGroup] {
        &self.groups
    }

    pub fn span_count(&self) -> usize {
        self.groups.iter().map(|g| g.spans.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileReceipt {
    pub vendor_slug: String,
    pub profile_id: i64,
    /// True when this unit inserted the profile row.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistReceipt {
    pub profiles: Vec<ProfileReceipt>,
    /// Rows actually written; re-delivered spans are skipped by the store.
    pub inserted_spans: u64,
}

impl PersistReceipt {
    pub fn created_profiles(&self) -> impl Iterator<Item = &ProfileReceipt> {
        self.profiles.iter().filter(|p| p.created)
    }
}

#[async_trait]
pub trait SpanStore: Send + Sync {
    async fn persist(&self, unit: &PersistUnit) -> CoreResult<PersistReceipt>;
}
