use std::fmt::{Debug, Display, Formatter};

use uuid::Uuid;

/// A logical address above the datagram substrate: the identity owning the end point plus a
///  port that is multiplexed on top of it. Connections are registered under their local
///  `EndPoint`, listeners under the `EndPoint` they accept connections on.
///
/// Ordering is lexicographic by `(identity, port)`, which is exactly the field order - keep it
///  that way, maps rely on it.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EndPoint {
    pub identity: Uuid,
    pub port: u16,
}

impl EndPoint {
    pub fn new(identity: Uuid, port: u16) -> EndPoint {
        EndPoint { identity, port }
    }

    /// the same identity with a different port
    pub fn with_port(&self, port: u16) -> EndPoint {
        EndPoint {
            identity: self.identity,
            port,
        }
    }
}

impl Debug for EndPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.identity, self.port)
    }
}

impl Display for EndPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.identity, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ep(identity: u128, port: u16) -> EndPoint {
        EndPoint::new(Uuid::from_u128(identity), port)
    }

    #[rstest]
    #[case::same(ep(1, 5), ep(1, 5), std::cmp::Ordering::Equal)]
    #[case::port_decides(ep(1, 5), ep(1, 6), std::cmp::Ordering::Less)]
    #[case::identity_before_port(ep(1, 9), ep(2, 1), std::cmp::Ordering::Less)]
    #[case::identity_greater(ep(3, 1), ep(2, 65535), std::cmp::Ordering::Greater)]
    fn test_ordering(#[case] a: EndPoint, #[case] b: EndPoint, #[case] expected: std::cmp::Ordering) {
        assert_eq!(a.cmp(&b), expected);
    }

    #[test]
    fn test_with_port() {
        let a = ep(7, 100);
        let b = a.with_port(200);
        assert_eq!(b.identity, a.identity);
        assert_eq!(b.port, 200);
    }

    #[test]
    fn test_display() {
        assert_eq!(ep(1, 80).to_string(), "00000000-0000-0000-0000-000000000001:80");
    }
}
