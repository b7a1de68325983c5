use std::collections::HashSet;

use time::OffsetDateTime;

use crate::kind::ProviderKind;
use crate::machine::{MachineRecord, ProviderConnection};

/// Outcome of picking an account for a provider.
#[derive(Debug, Clone)]
pub enum CredentialSelection {
    Selected(ProviderConnection),
    /// Every matching connection is cooling down; callers surface 429 with
    /// the soonest recovery.
    AllRateLimited {
        retry_after_secs: i64,
        last_error: Option<String>,
    },
    None,
}

/// Pick the preferred usable connection for `provider`:
/// active, not excluded, not rate-limited; lowest priority wins, ties broken
/// by newer `updated_at`.
pub fn select_credential(
    record: &MachineRecord,
    provider: &ProviderKind,
    exclude: &HashSet<String>,
    now: OffsetDateTime,
) -> CredentialSelection {
    let mut usable: Vec<&ProviderConnection> = Vec::new();
    let mut cooling: Vec<&ProviderConnection> = Vec::new();

    for connection in record.providers.values() {
        if &connection.provider != provider || !connection.is_active {
            continue;
        }
        if exclude.contains(&connection.id) {
            continue;
        }
        if connection.is_cooling_down(now) {
            cooling.push(connection);
        } else {
            usable.push(connection);
        }
    }

    usable.sort_by(|a, b| {
        a.priority.cmp(&b.priority).then_with(|| {
            // Newer updated_at first.
            b.health
                .updated_at
                .cmp(&a.health.updated_at)
        })
    });

    if let Some(head) = usable.first() {
        return CredentialSelection::Selected((*head).clone());
    }

    if let Some(soonest) = cooling
        .iter()
        .filter_map(|connection| connection.health.rate_limited_until)
        .min()
    {
        let earliest = cooling
            .iter()
            .find(|connection| connection.health.rate_limited_until == Some(soonest));
        let retry_after_secs = (soonest - now).whole_seconds().max(1);
        return CredentialSelection::AllRateLimited {
            retry_after_secs,
            last_error: earliest.and_then(|connection| connection.health.last_error.clone()),
        };
    }

    CredentialSelection::None
}
