//! Data plane components
//!
//! The six-stage translation pipeline and the databases it consults:
//! incoming-tuple extraction, filtering and updating, outgoing-tuple
//! computation, packet translation, hairpin detection, and emission of the
//! results back to the caller.

mod bib;
mod engine;
mod filtering;
mod incoming;
mod outgoing;
mod pkt_queue;
mod pool4;
mod pool6;
mod rfc6052;
mod runtime;
mod session;
mod session_db;
mod translate;
mod translate_4to6;
mod translate_6to4;
mod types;

pub use bib::{Bib, BibEntry};
pub use engine::{CoreState, Nat64, Outcome, SessionView};
pub use filtering::{FilterDecision, PacketMeta};
pub use incoming::{incoming_tuple, TupleError};
pub use outgoing::outgoing_tuple;
pub use pkt_queue::{PktQueue, DEFAULT_MAX_PKTS};
pub use pool4::Pool4;
pub use pool6::Pool6;
pub use rfc6052::{addr_4to6, addr_6to4, Prefix6, PREFIX_LENGTHS};
pub use runtime::{
    normalize_plateaus, validate_ttls, ConfigHandle, FilteringConfig, FragmentationConfig,
    PktQueueConfig, RuntimeConfig, SessionDbConfig, TranslateConfig, DEFAULT_MTU_PLATEAUS,
    IPV6_MIN_MTU,
};
pub use session::{ExpirerKind, Key4, Key6, SessionEntry, TcpState};
pub use session_db::{ExpireEvent, SessionDb, SessionTtls, TCP_INCOMING_SYN};
pub use translate::{translate, TranslateOutcome};
pub use types::{
    L3Proto, L4Proto, OutPacket, TransportAddr4, TransportAddr6, Tuple, Tuple4, Tuple6, Verdict,
};
