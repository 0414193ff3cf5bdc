use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::ImportStore;

const MAX_CODE_LEN: usize = 8;
const FALLBACK_CODE: &str = "LOC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub code: String,
    pub estate_label: Option<String>,
}

impl Location {
    /// Label shown on dispatch rows: the estate label when set, else the name.
    pub fn display_label(&self) -> &str {
        self.estate_label.as_deref().unwrap_or(&self.name)
    }

    fn matches_folded(&self, folded: &str) -> bool {
        fold_label(&self.name) == folded
            || fold_label(&self.code) == folded
            || self
                .estate_label
                .as_deref()
                .is_some_and(|label| fold_label(label) == folded)
    }
}

/// Per-run memo of resolved locations. Created fresh for every import and
/// passed by reference into the commit step, so concurrent imports never
/// share entries.
#[derive(Debug, Default)]
pub struct LocationCache {
    by_label: HashMap<String, Location>,
    by_id: HashMap<Uuid, Location>,
    known: Option<Vec<Location>>,
    created: usize,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }

    /// Locations this run had to create.
    pub fn created(&self) -> usize {
        self.created
    }

    fn remember(&mut self, label: &str, location: &Location) {
        self.by_label.insert(label.to_lowercase(), location.clone());
        self.by_id.insert(location.id, location.clone());
        if let Some(known) = self.known.as_mut() {
            if !known.iter().any(|existing| existing.id == location.id) {
                known.push(location.clone());
            }
        }
    }

    fn fuzzy_match(&self, label: &str) -> Option<Location> {
        let folded = fold_label(label);
        if folded.is_empty() {
            return None;
        }
        self.known
            .as_ref()?
            .iter()
            .find(|location| location.matches_folded(&folded))
            .cloned()
    }
}

/// Short code for a new location: the label's alphanumerics, upper-cased,
/// at most eight characters, `LOC` when nothing usable remains.
///
/// Codes are case-folded so two imports racing on "north" and "North"
/// collide on the same unique key.
pub fn derive_location_code(label: &str) -> String {
    let code: String = label
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .take(MAX_CODE_LEN)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    if code.is_empty() {
        FALLBACK_CODE.to_string()
    } else {
        code
    }
}

fn fold_label(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Resolves a free-text location reference to a tenant location, creating
/// one on first use. `Ok(None)` means the label could not be resolved and
/// the row should be skipped.
pub async fn resolve_location<S>(
    store: &S,
    tenant_id: Uuid,
    cache: &mut LocationCache,
    raw_label: &str,
) -> Result<Option<Location>, StoreError>
where
    S: ImportStore + ?Sized,
{
    let label = raw_label.trim();
    if label.is_empty() {
        return Ok(None);
    }

    if let Ok(id) = Uuid::parse_str(label) {
        if let Some(hit) = cache.by_id.get(&id) {
            return Ok(Some(hit.clone()));
        }
        let found = store.find_location_by_id(tenant_id, id).await?;
        if let Some(location) = &found {
            cache.remember(label, location);
        }
        return Ok(found);
    }

    if let Some(hit) = cache.by_label.get(&label.to_lowercase()) {
        return Ok(Some(hit.clone()));
    }

    if cache.known.is_none() {
        cache.known = Some(store.list_locations(tenant_id).await?);
    }
    if let Some(location) = cache.fuzzy_match(label) {
        cache.remember(label, &location);
        return Ok(Some(location));
    }

    let code = derive_location_code(label);
    let location = match store.insert_location(tenant_id, &code, label).await? {
        Some(created) => {
            debug!(%tenant_id, code = %created.code, name = %created.name, "created location");
            cache.created += 1;
            created
        }
        None => match store.find_location_by_code(tenant_id, &code).await? {
            Some(existing) => existing,
            None => {
                warn!(
                    %tenant_id,
                    %code,
                    label,
                    "location insert conflicted but no row found by code"
                );
                return Ok(None);
            }
        },
    };

    cache.remember(label, &location);
    Ok(Some(location))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_alphanumeric_prefixes() {
        assert_eq!(derive_location_code("North Block"), "NORTHBLO");
        assert_eq!(derive_location_code("b-7"), "B7");
        assert_eq!(derive_location_code("  ---  "), "LOC");
        assert_eq!(derive_location_code("Kaapi Thota Estate"), "KAAPITHO");
    }

    #[test]
    fn folding_ignores_case_and_punctuation() {
        assert_eq!(fold_label("Hill-Top  Block"), "hilltopblock");
    }

    #[test]
    fn display_label_prefers_estate_label() {
        let mut location = Location {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Block 4".into(),
            code: "BLOCK4".into(),
            estate_label: None,
        };
        assert_eq!(location.display_label(), "Block 4");
        location.estate_label = Some("Riverside Estate".into());
        assert_eq!(location.display_label(), "Riverside Estate");
    }
}
