//! Path expressions
//!
//! A dial path is a `->`-separated chain of hops, e.g.
//! `master->slaver->tcp://host:port`. Every hop but the last names a peer to
//! relay through; the last hop is a terminal URI dialed by the node that
//! receives it. A relay hop may take the `name@remainder` form, where the
//! part before `@` is the alias used for channel matching.
//!
//! The `->` operator is not quotable: names and URIs must not contain it.

use crate::error::{BraidError, Result};

/// Hop separator in a path expression
pub const HOP_SEPARATOR: &str = "->";

/// In-process echo target, accepted bare or as `tcp://echo`
pub const ECHO_URI: &str = "echo";

/// Split a path into its first hop and the remainder.
///
/// `"a->b->c"` yields `("a", Some("b->c"))`; a single hop yields
/// `("a", None)`.
pub fn split_head(path: &str) -> (&str, Option<&str>) {
    match path.split_once(HOP_SEPARATOR) {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    }
}

/// Does this hop name a terminal target rather than a relay peer?
///
/// Terminal hops carry a URI scheme (`tcp://…`) or are the bare in-process
/// echo target.
pub fn is_terminal(hop: &str) -> bool {
    hop.contains("://") || hop == ECHO_URI
}

/// The peer name a relay hop matches channels by.
///
/// `name@remainder` is an alias for plain `name`; the remainder does not
/// participate in routing.
pub fn hop_name(hop: &str) -> &str {
    match hop.split_once('@') {
        Some((name, _)) => name,
        None => hop,
    }
}

/// Scheme of a terminal URI, if it has one
pub fn scheme(uri: &str) -> Option<&str> {
    uri.split_once("://").map(|(scheme, _)| scheme)
}

/// Reject paths that cannot be resolved: empty expressions or empty hops.
pub fn validate(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(BraidError::EmptyPath);
    }
    if path.split(HOP_SEPARATOR).any(|hop| hop.is_empty()) {
        return Err(BraidError::EmptyPath);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_head() {
        assert_eq!(
            split_head("master->slaver->tcp://x:1"),
            ("master", Some("slaver->tcp://x:1"))
        );
        assert_eq!(split_head("tcp://x:1"), ("tcp://x:1", None));
    }

    #[test]
    fn test_is_terminal() {
        assert!(is_terminal("tcp://127.0.0.1:80"));
        assert!(is_terminal("tcp://echo"));
        assert!(is_terminal("echo"));
        assert!(!is_terminal("master"));
        assert!(!is_terminal("master@backup"));
    }

    #[test]
    fn test_hop_name_alias() {
        assert_eq!(hop_name("master"), "master");
        assert_eq!(hop_name("master@eu-1"), "master");
    }

    #[test]
    fn test_scheme() {
        assert_eq!(scheme("tcp://x:1"), Some("tcp"));
        assert_eq!(scheme("echo"), None);
    }

    #[test]
    fn test_validate() {
        assert!(validate("master->tcp://x:1").is_ok());
        assert!(matches!(validate(""), Err(BraidError::EmptyPath)));
        assert!(matches!(validate("a->->b"), Err(BraidError::EmptyPath)));
        assert!(matches!(validate("a->"), Err(BraidError::EmptyPath)));
    }
}
