//! Destination handles and name resolution.
//!
//! A [`Destination`] pairs a kind (queue, topic, or their temporary forms)
//! with a physical name. [`DestinationResolver`] maps user-supplied names to
//! handles, memoising per session; names may carry an explicit
//! `queue://`/`topic://` prefix, otherwise the resolver's default domain
//! applies.

use std::collections::HashMap;
use std::fmt;

use crate::error::{MessagingError, Result};

/// Kind tag carried by every destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    /// Point-to-point destination.
    Queue,
    /// Publish/subscribe destination.
    Topic,
    /// Connection-scoped queue, removed when its connection closes.
    TemporaryQueue,
    /// Connection-scoped topic, removed when its connection closes.
    TemporaryTopic,
}

/// A broker destination handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    kind: DestinationKind,
    physical_name: String,
}

impl Destination {
    /// Create a queue destination.
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            physical_name: name.into(),
        }
    }

    /// Create a topic destination.
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            physical_name: name.into(),
        }
    }

    pub(crate) fn temporary(kind: DestinationKind, name: impl Into<String>) -> Self {
        debug_assert!(matches!(
            kind,
            DestinationKind::TemporaryQueue | DestinationKind::TemporaryTopic
        ));
        Self {
            kind,
            physical_name: name.into(),
        }
    }

    /// The destination kind.
    #[must_use]
    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    /// The broker-side name.
    #[must_use]
    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }

    /// True for temporary queues and topics.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(
            self.kind,
            DestinationKind::TemporaryQueue | DestinationKind::TemporaryTopic
        )
    }

    pub(crate) fn prefix(&self) -> &'static str {
        match self.kind {
            DestinationKind::Queue => "queue://",
            DestinationKind::Topic => "topic://",
            DestinationKind::TemporaryQueue => "temp-queue://",
            DestinationKind::TemporaryTopic => "temp-topic://",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix(), self.physical_name)
    }
}

/// Per-session cache mapping names to resolved destinations.
///
/// Temporary destinations are never resolvable by name; entries live as long
/// as the owning session.
#[derive(Debug)]
pub(crate) struct DestinationResolver {
    cache: HashMap<String, Destination>,
    pub_sub_domain: bool,
}

impl DestinationResolver {
    pub(crate) fn new(pub_sub_domain: bool) -> Self {
        Self {
            cache: HashMap::new(),
            pub_sub_domain,
        }
    }

    /// Resolve `name` to a destination, consulting the cache first.
    pub(crate) fn resolve(&mut self, name: &str) -> Result<Destination> {
        if let Some(found) = self.cache.get(name) {
            return Ok(found.clone());
        }
        let destination = if let Some(rest) = name.strip_prefix("queue://") {
            Destination::queue(rest)
        } else if let Some(rest) = name.strip_prefix("topic://") {
            Destination::topic(rest)
        } else if name.starts_with("temp-queue://") || name.starts_with("temp-topic://") {
            return Err(MessagingError::illegal_argument(format!(
                "temporary destinations are not resolvable by name: `{name}`"
            )));
        } else if self.pub_sub_domain {
            Destination::topic(name)
        } else {
            Destination::queue(name)
        };
        self.cache.insert(name.to_owned(), destination.clone());
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("queue://orders", DestinationKind::Queue, "orders")]
    #[case("topic://prices", DestinationKind::Topic, "prices")]
    #[case("plain", DestinationKind::Queue, "plain")]
    fn resolves_prefixes_and_defaults(
        #[case] name: &str,
        #[case] kind: DestinationKind,
        #[case] physical: &str,
    ) {
        let mut resolver = DestinationResolver::new(false);
        let dest = resolver.resolve(name).expect("resolve");
        assert_eq!(dest.kind(), kind);
        assert_eq!(dest.physical_name(), physical);
    }

    #[test]
    fn default_domain_can_be_pub_sub() {
        let mut resolver = DestinationResolver::new(true);
        let dest = resolver.resolve("alerts").expect("resolve");
        assert_eq!(dest.kind(), DestinationKind::Topic);
    }

    #[test]
    fn temporaries_are_not_resolvable() {
        let mut resolver = DestinationResolver::new(false);
        assert!(matches!(
            resolver.resolve("temp-queue://abc"),
            Err(MessagingError::IllegalArgument(_))
        ));
    }

    #[test]
    fn cache_returns_the_same_destination() {
        let mut resolver = DestinationResolver::new(false);
        let first = resolver.resolve("orders").expect("resolve");
        let second = resolver.resolve("orders").expect("resolve");
        assert_eq!(first, second);
    }

    #[test]
    fn display_carries_the_kind_prefix() {
        assert_eq!(Destination::topic("prices").to_string(), "topic://prices");
        assert_eq!(
            Destination::temporary(DestinationKind::TemporaryQueue, "abc").to_string(),
            "temp-queue://abc"
        );
    }
}
