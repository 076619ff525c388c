//! NAT descriptor and the port-mapping/prediction data model.

use std::net::SocketAddr;

/// Classification of how a NAT allocates outbound TCP source ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    /// The NAT preserves the local source port verbatim.
    Preserving,
    /// The NAT applies a fixed additive offset to the local source port.
    Delta,
    /// The NAT reuses a single mapped port regardless of local source port.
    Reuse,
    /// No discernible pattern; port prediction is not possible.
    Random,
    /// Not yet characterized.
    Unknown,
}

impl NatKind {
    /// Whether the NAT's remote-port mapping can be predicted from the
    /// local source port (a prerequisite for a simultaneous-open attempt).
    pub fn is_predictable(self) -> bool {
        matches!(self, NatKind::Preserving | NatKind::Delta)
    }
}

/// Classification result: NAT kind plus the additive delta (meaningful only
/// when `kind == Delta`).
///
/// Invariant: `delta == 0` unless `kind == Delta`; `|delta| <= 65534`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatDescriptor {
    pub kind: NatKind,
    pub delta: i32,
}

impl NatDescriptor {
    pub const MAX_DELTA: i32 = 65534;

    /// Construct a descriptor, enforcing the delta invariant.
    pub fn new(kind: NatKind, delta: i32) -> Self {
        let delta = if kind == NatKind::Delta {
            delta.clamp(-Self::MAX_DELTA, Self::MAX_DELTA)
        } else {
            0
        };
        Self { kind, delta }
    }

    pub fn preserving() -> Self {
        Self::new(NatKind::Preserving, 0)
    }

    pub fn delta(delta: i32) -> Self {
        Self::new(NatKind::Delta, delta)
    }

    pub fn reuse() -> Self {
        Self::new(NatKind::Reuse, 0)
    }

    pub fn random() -> Self {
        Self::new(NatKind::Random, 0)
    }

    pub fn unknown() -> Self {
        Self::new(NatKind::Unknown, 0)
    }
}

/// A port mapping observed by characterizing against the rendezvous server:
/// the local port we bound, and the remote port the server echoed back as
/// our observed source port.
#[derive(Debug, Clone, Copy)]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_port: u16,
    pub rendezvous_server: SocketAddr,
}

/// A `PortMapping` extended with the port we expect the peer's NAT to
/// assign when we connect outbound from `local_port`.
#[derive(Debug, Clone, Copy)]
pub struct PredictedMapping {
    pub mapping: PortMapping,
    pub predicted_remote: Option<u16>,
}

/// Wrap `value` into the valid port range `[1, 65535]`, treating the space
/// as a ring of size 65535 (port 0 never appears on the wire).
pub(crate) fn wrap_port(value: i64) -> u16 {
    let span = 65535i64;
    let zero_based = ((value - 1).rem_euclid(span)) as i64;
    (zero_based + 1) as u16
}

/// Apply a NAT descriptor's port-allocation rule to a single local port.
/// Returns `None` when the NAT kind does not support prediction.
pub fn predict_port(nat: &NatDescriptor, local_port: u16) -> Option<u16> {
    match nat.kind {
        NatKind::Preserving => Some(local_port),
        NatKind::Delta => Some(wrap_port(local_port as i64 + nat.delta as i64)),
        NatKind::Reuse | NatKind::Random | NatKind::Unknown => None,
    }
}

/// Apply `predict_port` across a batch of observed mappings, producing a
/// `PredictedMapping` for each. Mappings for non-predictable NATs carry
/// `predicted_remote: None` -- the fight is not attempted for them.
pub fn predict_mappings(nat: &NatDescriptor, mappings: &[PortMapping]) -> Vec<PredictedMapping> {
    mappings
        .iter()
        .map(|m| PredictedMapping {
            mapping: *m,
            predicted_remote: predict_port(nat, m.local_port),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.1:9000".parse().unwrap()
    }

    #[test]
    fn preserving_predicts_identity() {
        let nat = NatDescriptor::preserving();
        assert_eq!(predict_port(&nat, 40000), Some(40000));
    }

    #[test]
    fn delta_predicts_with_wraparound() {
        let nat = NatDescriptor::delta(10);
        assert_eq!(predict_port(&nat, 40000), Some(40010));
    }

    #[test]
    fn delta_wraps_at_port_boundary_not_to_zero() {
        // local=65535, delta=+1 must yield 1, never 0 or 65536.
        let nat = NatDescriptor::delta(1);
        assert_eq!(predict_port(&nat, 65535), Some(1));
    }

    #[test]
    fn delta_wraps_negative() {
        let nat = NatDescriptor::delta(-5);
        assert_eq!(predict_port(&nat, 3), Some(65533));
    }

    #[test]
    fn random_and_reuse_have_no_prediction() {
        assert_eq!(predict_port(&NatDescriptor::random(), 1000), None);
        assert_eq!(predict_port(&NatDescriptor::reuse(), 1000), None);
        assert_eq!(predict_port(&NatDescriptor::unknown(), 1000), None);
    }

    #[test]
    fn descriptor_invariant_zeroes_delta_for_non_delta_kinds() {
        let nat = NatDescriptor::new(NatKind::Preserving, 99);
        assert_eq!(nat.delta, 0);
    }

    #[test]
    fn descriptor_invariant_clamps_delta_magnitude() {
        let nat = NatDescriptor::new(NatKind::Delta, 200_000);
        assert_eq!(nat.delta, NatDescriptor::MAX_DELTA);
    }

    #[test]
    fn predict_mappings_batches_correctly() {
        let nat = NatDescriptor::delta(10);
        let mappings = vec![
            PortMapping {
                local_port: 40000,
                remote_port: 40010,
                rendezvous_server: addr(),
            },
            PortMapping {
                local_port: 40001,
                remote_port: 40011,
                rendezvous_server: addr(),
            },
        ];
        let predicted = predict_mappings(&nat, &mappings);
        assert_eq!(predicted[0].predicted_remote, Some(40010));
        assert_eq!(predicted[1].predicted_remote, Some(40011));
    }
}
