//! Store key layout
//!
//! | Purpose          | Key                                  |
//! |------------------|--------------------------------------|
//! | Active registry  | `schema:<gateway>`                   |
//! | Instance counter | `schema:<gateway>:s:<hash>`          |
//! | Triage entry     | `schema:t:<gateway>:<hash>`          |
//! | Triage pointer   | `schema:t:<gateway>:c:<parentHash>`  |
//! | Lease lock       | `schema:l:<gateway>`                 |

const SCHEMA: &str = "schema";
const TRIAGE: &str = "t";
const LOCK: &str = "l";
const SERVICES: &str = "s";
const CHILD: &str = "c";

pub fn registry(gateway: &str) -> String {
    format!("{SCHEMA}:{gateway}")
}

pub fn instances(gateway: &str, hash: &str) -> String {
    format!("{SCHEMA}:{gateway}:{SERVICES}:{hash}")
}

pub fn triage(gateway: &str, hash: &str) -> String {
    format!("{SCHEMA}:{TRIAGE}:{gateway}:{hash}")
}

pub fn triage_pointer(gateway: &str, parent_hash: &str) -> String {
    format!("{SCHEMA}:{TRIAGE}:{gateway}:{CHILD}:{parent_hash}")
}

pub fn lock(gateway: &str) -> String {
    format!("{SCHEMA}:{LOCK}:{gateway}")
}

/// Gateway names become a key segment: non-empty, colon-free, and not one of
/// the reserved segment tags (which would alias triage or lock keys).
pub fn is_valid_gateway(gateway: &str) -> bool {
    !gateway.is_empty() && !gateway.contains(':') && gateway != TRIAGE && gateway != LOCK
}

/// Returns the gateway name if `key` is an active registry key.
pub fn parse_registry_key(key: &str) -> Option<&str> {
    let gateway = key.strip_prefix(SCHEMA)?.strip_prefix(':')?;
    is_valid_gateway(gateway).then_some(gateway)
}
