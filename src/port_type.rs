use std::{fmt, ops};

/// A set of port classification flags.
///
/// The SERVER/LISTEN/KEEPALIVE/... distinctions are orthogonal capabilities
/// of a single port, not kinds of port, so they are modeled as a bitset.
/// A port accumulates flags as subsystems register interest in it and sheds
/// them on partial deregistration.
///
/// `PortType` values can be combined with the usual bitwise operators.
///
/// # Examples
///
/// ```
/// use libos_ipc::PortType;
///
/// let ty = PortType::listen() | PortType::pollable();
///
/// assert!(ty.is_pollable());
/// assert!(!ty.is_server());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
pub struct PortType(usize);

const SERVER: usize        = 0b000_0001;
const KEEPALIVE: usize     = 0b000_0010;
const LISTEN: usize        = 0b000_0100;
const DIRECT_PARENT: usize = 0b000_1000;
const PID_LEADER: usize    = 0b001_0000;
const SYSV_LEADER: usize   = 0b010_0000;
const POLLABLE: usize      = 0b100_0000;
const TYPE_ALL: usize = SERVER | KEEPALIVE | LISTEN | DIRECT_PARENT
    | PID_LEADER | SYSV_LEADER | POLLABLE;

impl PortType {
    /// Returns the empty flag set.
    #[inline]
    pub fn empty() -> PortType {
        PortType(0)
    }

    /// A server port: the helper accepts clients on it instead of reading.
    #[inline]
    pub fn server() -> PortType {
        PortType(SERVER)
    }

    /// A keepalive port: its existence keeps the helper thread alive past
    /// its owner's exit.
    #[inline]
    pub fn keepalive() -> PortType {
        PortType(KEEPALIVE)
    }

    /// An established stream the helper reads framed messages from.
    #[inline]
    pub fn listen() -> PortType {
        PortType(LISTEN)
    }

    /// The stream to the direct parent instance.
    #[inline]
    pub fn direct_parent() -> PortType {
        PortType(DIRECT_PARENT)
    }

    /// The stream to the pid-namespace leader.
    #[inline]
    pub fn pid_leader() -> PortType {
        PortType(PID_LEADER)
    }

    /// The stream to the System-V-namespace leader.
    #[inline]
    pub fn sysv_leader() -> PortType {
        PortType(SYSV_LEADER)
    }

    /// A port whose readability the helper must monitor.
    #[inline]
    pub fn pollable() -> PortType {
        PortType(POLLABLE)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == PortType::empty()
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.contains(PortType::server())
    }

    #[inline]
    pub fn is_keepalive(&self) -> bool {
        self.contains(PortType::keepalive())
    }

    #[inline]
    pub fn is_pollable(&self) -> bool {
        self.contains(PortType::pollable())
    }

    /// Adds all flags represented by `other` into `self`.
    #[inline]
    pub fn insert(&mut self, other: PortType) {
        self.0 |= other.0;
    }

    /// Removes all flags represented by `other` from `self`.
    #[inline]
    pub fn remove(&mut self, other: PortType) {
        self.0 &= !other.0;
    }

    /// Returns true if `self` is a superset of `other`.
    ///
    /// ```
    /// use libos_ipc::PortType;
    ///
    /// let ty = PortType::server() | PortType::pollable();
    ///
    /// assert!(ty.contains(PortType::server()));
    /// assert!(!ty.contains(PortType::server() | PortType::listen()));
    /// ```
    #[inline]
    pub fn contains(&self, other: PortType) -> bool {
        (*self & other) == other
    }

    /// Returns true if `self` and `other` share at least one flag.
    #[inline]
    pub fn intersects(&self, other: PortType) -> bool {
        !(*self & other).is_empty()
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl ops::BitOr for PortType {
    type Output = PortType;

    #[inline]
    fn bitor(self, other: PortType) -> PortType {
        PortType(self.0 | other.0)
    }
}

impl ops::BitXor for PortType {
    type Output = PortType;

    #[inline]
    fn bitxor(self, other: PortType) -> PortType {
        PortType(self.0 ^ other.0)
    }
}

impl ops::BitAnd for PortType {
    type Output = PortType;

    #[inline]
    fn bitand(self, other: PortType) -> PortType {
        PortType(self.0 & other.0)
    }
}

impl ops::Sub for PortType {
    type Output = PortType;

    #[inline]
    fn sub(self, other: PortType) -> PortType {
        PortType(self.0 & !other.0)
    }
}

impl ops::Not for PortType {
    type Output = PortType;

    #[inline]
    fn not(self) -> PortType {
        PortType(!self.0 & TYPE_ALL)
    }
}

impl fmt::Debug for PortType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (PortType(SERVER), "Server"),
            (PortType(KEEPALIVE), "Keepalive"),
            (PortType(LISTEN), "Listen"),
            (PortType(DIRECT_PARENT), "DirectParent"),
            (PortType(PID_LEADER), "PidLeader"),
            (PortType(SYSV_LEADER), "SysvLeader"),
            (PortType(POLLABLE), "Pollable"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::PortType;

    #[test]
    fn flag_algebra() {
        let ty = PortType::server() | PortType::pollable();

        assert!(ty.is_server());
        assert!(ty.is_pollable());
        assert!(!ty.is_keepalive());

        let ty = (ty - PortType::server()) | PortType::listen();
        assert!(!ty.is_server());
        assert!(ty.contains(PortType::listen() | PortType::pollable()));
    }

    #[test]
    fn intersects_and_remove() {
        let mut ty = PortType::listen() | PortType::keepalive();

        assert!(ty.intersects(PortType::keepalive() | PortType::server()));
        assert!(!ty.intersects(PortType::server()));

        ty.remove(PortType::keepalive());
        assert_eq!(ty, PortType::listen());
    }
}
