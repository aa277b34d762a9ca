//! `HubResolver`: resolves an inbound request to the hub-id it targets
//! (`spec.md` §9 Open Question — multi-hub-per-account routing is left
//! to a collaborator rather than prescribed by the core).
//!
//! The core only ever calls `resolve_hub_id` and records the result in
//! the audit log; how an account maps to a hub (subdomain, API key,
//! session cookie) is entirely up to the implementation supplied.

/// Default implementation: the hub-id is the leading label of the
/// `Host` header, matching this system's actual subdomain routing
/// (`<hub-id>.<public_host>`).
pub struct SubdomainHubResolver;

impl SubdomainHubResolver {
    #[must_use]
    pub fn resolve(&self, host: &str) -> Option<String> {
        let host = host.split(':').next().unwrap_or(host);
        host.split('.').next().filter(|label| !label.is_empty()).map(str::to_string)
    }
}
