//! Pipeline stage 4: build the translated packet.
//!
//! The stage table of the RFC (build L3, translate L4 and payload, post L3,
//! post L4, indexed by incoming protocols) collapses naturally onto tagged
//! dispatch: the outgoing tuple's family picks the direction, its transport
//! protocol picks the L4 treatment inside it.

use super::runtime::TranslateConfig;
use super::translate_4to6;
use super::translate_6to4;
use super::types::{OutPacket, Tuple};

/// What the translator did with the packet.
#[derive(Debug)]
pub enum TranslateOutcome {
    /// The translated packet, split into fragments when needed. Order is
    /// wire order; the first element carries the transport header.
    Forward(Vec<OutPacket>),
    /// The packet cannot be translated. `icmp_error`, when present, is a
    /// fully-formed error packet for the sender, in the sender's family.
    Drop { icmp_error: Option<OutPacket> },
}

impl TranslateOutcome {
    pub(super) fn drop_silent() -> Self {
        TranslateOutcome::Drop { icmp_error: None }
    }
}

/// Translates "packet" into the family dictated by "out_tuple".
pub fn translate(packet: &[u8], out_tuple: &Tuple, config: &TranslateConfig) -> TranslateOutcome {
    match out_tuple {
        Tuple::V4(tuple) => translate_6to4::translate(packet, tuple, config),
        Tuple::V6(tuple) => translate_4to6::translate(packet, tuple, config),
    }
}
