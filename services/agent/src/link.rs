//! Link attributes as reported by the kernel, and the readiness predicate.
//!
//! A freshly created tap reports "up" before the guest has finished
//! link-local address assignment and DAD. Waiting until the interface has
//! transmitted at least one packet keeps us from racing the guest (and
//! live-migration handoff) with bind attempts that are bound to fail.

use tapra_networking::ndp::MacAddr;

/// RFC 2863 operational state (`IFLA_OPERSTATE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperState {
    #[default]
    Unknown,
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

impl From<u8> for OperState {
    fn from(value: u8) -> Self {
        match value {
            1 => OperState::NotPresent,
            2 => OperState::Down,
            3 => OperState::LowerLayerDown,
            4 => OperState::Testing,
            5 => OperState::Dormant,
            6 => OperState::Up,
            _ => OperState::Unknown,
        }
    }
}

impl std::fmt::Display for OperState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperState::Unknown => "unknown",
            OperState::NotPresent => "notpresent",
            OperState::Down => "down",
            OperState::LowerLayerDown => "lowerlayerdown",
            OperState::Testing => "testing",
            OperState::Dormant => "dormant",
            OperState::Up => "up",
        };
        f.write_str(s)
    }
}

/// Snapshot of one link's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkAttributes {
    pub index: u32,
    pub name: String,
    /// `IFF_UP` is set.
    pub admin_up: bool,
    pub oper_state: OperState,
    pub mtu: u32,
    pub hardware_addr: Option<MacAddr>,
    pub tx_packets: u64,
}

/// Whether an interface can be handed to the engine: administratively up,
/// operationally up, and it has transmitted at least one packet.
pub fn is_ready(attrs: &LinkAttributes) -> bool {
    attrs.admin_up && attrs.oper_state == OperState::Up && attrs.tx_packets > 0
}

/// A link change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// `RTM_NEWLINK`: link created or its attributes changed.
    Changed(LinkAttributes),
    /// `RTM_DELLINK`: link removed.
    Removed(LinkAttributes),
}

impl LinkEvent {
    pub fn attributes(&self) -> &LinkAttributes {
        match self {
            LinkEvent::Changed(attrs) | LinkEvent::Removed(attrs) => attrs,
        }
    }
}

/// The parts of an interface a session needs, captured once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHandle {
    pub index: u32,
    pub name: String,
    pub hardware_addr: MacAddr,
    pub mtu: u32,
}

impl InterfaceHandle {
    /// Build a handle from link attributes. Links without an Ethernet
    /// hardware address cannot carry a source link-layer option and yield
    /// `None`.
    pub fn from_attributes(attrs: &LinkAttributes) -> Option<Self> {
        Some(Self {
            index: attrs.index,
            name: attrs.name.clone(),
            hardware_addr: attrs.hardware_addr?,
            mtu: attrs.mtu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tap(admin_up: bool, oper_state: OperState, tx_packets: u64) -> LinkAttributes {
        LinkAttributes {
            index: 7,
            name: "tap42_0".to_string(),
            admin_up,
            oper_state,
            mtu: 1500,
            hardware_addr: Some(MacAddr([0xfe, 0, 0, 0, 0, 1])),
            tx_packets,
        }
    }

    #[test]
    fn test_not_ready_without_transmitted_packets() {
        assert!(!is_ready(&tap(true, OperState::Up, 0)));
        assert!(is_ready(&tap(true, OperState::Up, 1)));
    }

    #[rstest]
    #[case(false, OperState::Up, 10)]
    #[case(true, OperState::Down, 10)]
    #[case(true, OperState::LowerLayerDown, 10)]
    #[case(true, OperState::Unknown, 10)]
    fn test_not_ready(#[case] admin_up: bool, #[case] oper: OperState, #[case] tx: u64) {
        assert!(!is_ready(&tap(admin_up, oper, tx)));
    }

    #[test]
    fn test_oper_state_from_kernel_value() {
        assert_eq!(OperState::from(6), OperState::Up);
        assert_eq!(OperState::from(2), OperState::Down);
        assert_eq!(OperState::from(42), OperState::Unknown);
    }

    #[test]
    fn test_handle_requires_hardware_address() {
        let mut attrs = tap(true, OperState::Up, 1);
        let handle = InterfaceHandle::from_attributes(&attrs).unwrap();
        assert_eq!(handle.name, "tap42_0");
        assert_eq!(handle.mtu, 1500);

        attrs.hardware_addr = None;
        assert!(InterfaceHandle::from_attributes(&attrs).is_none());
    }
}
