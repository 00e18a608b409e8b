//! Namespacing of proxied tool/prompt/resource names — section 6.

/// `"<namespace>.<original_name>"` for tools and prompts.
pub fn namespaced_name(namespace: &str, original_name: &str) -> String {
    format!("{namespace}.{original_name}")
}

/// Splits a proxied tool/prompt name of the form `"<namespace>.<original>"`
/// back into its two parts. `None` if `name` carries no `.` separator (an
/// un-namespaced call, or one this gateway didn't prefix).
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once('.')
}

/// `"<namespace>://<original>"` for resource URIs.
///
/// Always prepends verbatim, even when `original` already carries a scheme
/// (resolved Open Question #3, SPEC_FULL.md section 9): the result is a
/// gateway-specific URI, not a re-parse of the inner one.
pub fn namespaced_uri(namespace: &str, original_uri: &str) -> String {
    format!("{namespace}://{original_uri}")
}
