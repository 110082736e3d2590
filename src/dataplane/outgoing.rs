//! Pipeline stage 3: derive the translated flow summary from the session.

use super::session::SessionEntry;
use super::types::{Tuple, Tuple4, Tuple6};

/// The outgoing tuple mirrors the session record: an IPv6-sourced packet
/// leaves as pool4 -> IPv4 peer, an IPv4-sourced packet leaves as embedded
/// peer -> IPv6 endpoint. ICMP identifiers ride in the transport addresses.
pub fn outgoing_tuple(incoming: &Tuple, session: &SessionEntry) -> Tuple {
    match incoming {
        Tuple::V6(tuple) => Tuple::V4(Tuple4 {
            src: session.local4,
            dst: session.remote4,
            l4: tuple.l4,
        }),
        Tuple::V4(tuple) => Tuple::V6(Tuple6 {
            src: session.remote6,
            dst: session.local6,
            l4: tuple.l4,
        }),
    }
}
