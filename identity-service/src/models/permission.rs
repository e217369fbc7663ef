//! Permission claims embedded in access tokens.
//!
//! The business modules read these claims as their sole authorization input;
//! unknown modules are denied by default rather than relying on key absence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use super::UserRole;

/// Closed set of business modules the platform authorizes against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Cases,
    Clients,
    Documents,
    Invoices,
    Hr,
    Crm,
    Reports,
}

/// Access levels, lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    View,
    Edit,
    Full,
}

/// The `module -> level` map carried in access-token claims.
pub type PermissionMap = BTreeMap<Module, AccessLevel>;

/// Default permission grant per role. Firm admin screens may narrow these
/// later; the token service only ever widens from an empty (deny-all) map.
pub fn default_permissions(role: UserRole, is_solo_lawyer: bool) -> PermissionMap {
    let mut map = PermissionMap::new();
    match role {
        UserRole::Client => {
            map.insert(Module::Cases, AccessLevel::View);
            map.insert(Module::Documents, AccessLevel::View);
            map.insert(Module::Invoices, AccessLevel::View);
        }
        UserRole::Lawyer => {
            map.insert(Module::Cases, AccessLevel::Full);
            map.insert(Module::Clients, AccessLevel::Full);
            map.insert(Module::Documents, AccessLevel::Full);
            map.insert(Module::Invoices, AccessLevel::Edit);
            map.insert(Module::Reports, AccessLevel::View);
            if is_solo_lawyer {
                // Solo practices get the back-office modules directly.
                map.insert(Module::Invoices, AccessLevel::Full);
                map.insert(Module::Hr, AccessLevel::Full);
                map.insert(Module::Crm, AccessLevel::Full);
                map.insert(Module::Reports, AccessLevel::Full);
            }
        }
    }
    map
}

/// Default-deny lookup: absent modules grant nothing.
pub fn allows(map: &PermissionMap, module: Module, required: AccessLevel) -> bool {
    map.get(&module).map_or(false, |level| *level >= required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_module_is_denied() {
        let map = default_permissions(UserRole::Client, false);
        assert!(!allows(&map, Module::Hr, AccessLevel::View));
        assert!(!allows(&map, Module::Crm, AccessLevel::View));
    }

    #[test]
    fn levels_are_ordered() {
        let map = default_permissions(UserRole::Lawyer, false);
        assert!(allows(&map, Module::Cases, AccessLevel::View));
        assert!(allows(&map, Module::Cases, AccessLevel::Full));
        assert!(allows(&map, Module::Invoices, AccessLevel::Edit));
        assert!(!allows(&map, Module::Invoices, AccessLevel::Full));
    }

    #[test]
    fn solo_lawyer_gets_back_office() {
        let map = default_permissions(UserRole::Lawyer, true);
        assert!(allows(&map, Module::Hr, AccessLevel::Full));
        assert!(allows(&map, Module::Invoices, AccessLevel::Full));
    }

    #[test]
    fn permission_map_round_trips_through_json() {
        let map = default_permissions(UserRole::Lawyer, true);
        let json = serde_json::to_string(&map).unwrap();
        let back: PermissionMap = serde_json::from_str(&json).unwrap();
        assert_eq!(map, back);
    }
}
