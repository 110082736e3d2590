//! The request/response protocol the userspace client speaks.
//!
//! Every request starts with a 6-byte header: total length (u32), mode
//! (u8), operation (u8). Responses start with total length (u32), status
//! (u8, zero on success) and a "more" flag (u8) used by paginated DISPLAY
//! operations: as long as it is set, the client repeats the request with
//! `iterate = true` and the last IPv4 transport address it saw.

pub mod wire;

use crate::dataplane::{
    normalize_plateaus, validate_ttls, L4Proto, Nat64, Prefix6, TransportAddr4, TransportAddr6,
};
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, warn};
use wire::{Reader, Writer};

/// Request header length: u32 length + mode + operation.
pub const HEADER_LEN: usize = 6;

/// Response header length: u32 length + status + more.
pub const RESPONSE_HEADER_LEN: usize = 6;

/// Entries per DISPLAY chunk.
const DISPLAY_CHUNK: usize = 64;

pub mod mode {
    pub const GENERAL: u8 = 1 << 0;
    pub const POOL6: u8 = 1 << 1;
    pub const POOL4: u8 = 1 << 2;
    pub const BIB: u8 = 1 << 3;
    pub const SESSION: u8 = 1 << 4;
}

pub mod op {
    pub const DISPLAY: u8 = 1 << 0;
    pub const COUNT: u8 = 1 << 1;
    pub const ADD: u8 = 1 << 2;
    pub const UPDATE: u8 = 1 << 3;
    pub const REMOVE: u8 = 1 << 4;
    pub const FLUSH: u8 = 1 << 5;
}

/// Which operations each mode accepts.
fn allowed_ops(mode: u8) -> u8 {
    match mode {
        mode::POOL6 | mode::POOL4 => op::DISPLAY | op::COUNT | op::ADD | op::REMOVE | op::FLUSH,
        mode::BIB => op::DISPLAY | op::COUNT | op::ADD | op::REMOVE,
        mode::SESSION => op::DISPLAY | op::COUNT,
        mode::GENERAL => op::DISPLAY | op::UPDATE,
        _ => 0,
    }
}

/// GENERAL UPDATE sub-structure selectors.
mod module {
    pub const SESSIONDB: u8 = 0;
    pub const PKTQUEUE: u8 = 1;
    pub const FILTERING: u8 = 2;
    pub const TRANSLATE: u8 = 3;
    pub const FRAGMENT: u8 = 4;
}

fn l4_from_wire(value: u8) -> Result<L4Proto> {
    match value {
        1 => Ok(L4Proto::Icmp),
        6 => Ok(L4Proto::Tcp),
        17 => Ok(L4Proto::Udp),
        other => Err(Error::Control(format!("bogus l4 protocol {}", other))),
    }
}

fn respond_ok(payload: Writer, more: bool) -> Vec<u8> {
    let payload = payload.into_bytes();
    let mut response = Writer::new();
    response
        .u32((RESPONSE_HEADER_LEN + payload.len()) as u32)
        .u8(0)
        .bool(more)
        .bytes(&payload);
    response.into_bytes()
}

fn respond_err(error: &Error) -> Vec<u8> {
    warn!(%error, "control request failed");
    let message = error.to_string();
    let mut response = Writer::new();
    response
        .u32((RESPONSE_HEADER_LEN + message.len()) as u32)
        .u8(1)
        .bool(false)
        .bytes(message.as_bytes());
    response.into_bytes()
}

/// Parses one framed request and executes it against the engine. Always
/// produces a response frame; protocol violations come back as errors.
pub fn handle_request(engine: &Nat64, request: &[u8]) -> Vec<u8> {
    match dispatch(engine, request) {
        Ok(response) => response,
        Err(error) => respond_err(&error),
    }
}

fn dispatch(engine: &Nat64, request: &[u8]) -> Result<Vec<u8>> {
    if request.len() < HEADER_LEN {
        return Err(Error::Control("request shorter than its header".into()));
    }
    let mut header = Reader::new(&request[..HEADER_LEN]);
    let length = header.u32()? as usize;
    let mode = header.u8()?;
    let operation = header.u8()?;

    if length != request.len() {
        return Err(Error::Control(format!(
            "header claims {} bytes, got {}",
            length,
            request.len()
        )));
    }
    if allowed_ops(mode) & operation == 0 || !operation.is_power_of_two() {
        return Err(Error::Control(format!(
            "mode {:#x} does not support operation {:#x}",
            mode, operation
        )));
    }

    debug!(mode, operation, "control request");
    let mut payload = Reader::new(&request[HEADER_LEN..]);

    match mode {
        mode::POOL6 => pool6_request(engine, operation, &mut payload),
        mode::POOL4 => pool4_request(engine, operation, &mut payload),
        mode::BIB => bib_request(engine, operation, &mut payload),
        mode::SESSION => session_request(engine, operation, &mut payload),
        mode::GENERAL => general_request(engine, operation, &mut payload),
        other => Err(Error::Control(format!("bogus mode {:#x}", other))),
    }
}

fn pool6_request(engine: &Nat64, operation: u8, payload: &mut Reader<'_>) -> Result<Vec<u8>> {
    match operation {
        op::DISPLAY => {
            let prefixes = engine.pool6_list();
            let mut out = Writer::new();
            out.u32(prefixes.len() as u32);
            for prefix in prefixes {
                out.ipv6(prefix.addr).u8(prefix.len);
            }
            Ok(respond_ok(out, false))
        }
        op::COUNT => {
            let mut out = Writer::new();
            out.u64(engine.pool6_count() as u64);
            Ok(respond_ok(out, false))
        }
        op::ADD => {
            let prefix = Prefix6::new(payload.ipv6()?, payload.u8()?);
            engine.pool6_add(prefix)?;
            Ok(respond_ok(Writer::new(), false))
        }
        op::REMOVE => {
            let prefix = Prefix6::new(payload.ipv6()?, payload.u8()?);
            let quick = payload.bool()?;
            engine.pool6_remove(&prefix, quick)?;
            Ok(respond_ok(Writer::new(), false))
        }
        op::FLUSH => {
            let quick = payload.bool()?;
            engine.pool6_flush(quick);
            Ok(respond_ok(Writer::new(), false))
        }
        _ => unreachable!("operation was validated against the mode"),
    }
}

fn pool4_request(engine: &Nat64, operation: u8, payload: &mut Reader<'_>) -> Result<Vec<u8>> {
    match operation {
        op::DISPLAY => {
            let addrs = engine.pool4_list();
            let mut out = Writer::new();
            out.u32(addrs.len() as u32);
            for addr in addrs {
                out.ipv4(addr);
            }
            Ok(respond_ok(out, false))
        }
        op::COUNT => {
            let mut out = Writer::new();
            out.u64(engine.pool4_count() as u64);
            Ok(respond_ok(out, false))
        }
        op::ADD => {
            engine.pool4_add(payload.ipv4()?)?;
            Ok(respond_ok(Writer::new(), false))
        }
        op::REMOVE => {
            let addr = payload.ipv4()?;
            let quick = payload.bool()?;
            engine.pool4_remove(addr, quick)?;
            Ok(respond_ok(Writer::new(), false))
        }
        op::FLUSH => {
            let quick = payload.bool()?;
            engine.pool4_flush(quick);
            Ok(respond_ok(Writer::new(), false))
        }
        _ => unreachable!("operation was validated against the mode"),
    }
}

fn read_cursor(payload: &mut Reader<'_>) -> Result<Option<TransportAddr4>> {
    let iterate = payload.bool()?;
    let addr = payload.ipv4()?;
    let port = payload.u16()?;
    Ok(iterate.then(|| TransportAddr4::new(addr, port)))
}

fn bib_request(engine: &Nat64, operation: u8, payload: &mut Reader<'_>) -> Result<Vec<u8>> {
    let l4 = l4_from_wire(payload.u8()?)?;
    match operation {
        op::DISPLAY => {
            let cursor = read_cursor(payload)?;
            let (page, more) = engine.bib_display(l4, cursor, DISPLAY_CHUNK);
            let mut out = Writer::new();
            out.u32(page.len() as u32);
            for entry in page {
                out.ipv6(entry.addr6.addr)
                    .u16(entry.addr6.l4_id)
                    .ipv4(entry.addr4.addr)
                    .u16(entry.addr4.l4_id)
                    .bool(entry.is_static);
            }
            Ok(respond_ok(out, more))
        }
        op::COUNT => {
            let mut out = Writer::new();
            out.u64(engine.bib_count(l4) as u64);
            Ok(respond_ok(out, false))
        }
        op::ADD => {
            let addr6 = TransportAddr6::new(payload.ipv6()?, payload.u16()?);
            let addr4 = TransportAddr4::new(payload.ipv4()?, payload.u16()?);
            engine.bib_add_static(addr6, addr4, l4)?;
            Ok(respond_ok(Writer::new(), false))
        }
        op::REMOVE => {
            let addr6_set = payload.bool()?;
            let addr6 = TransportAddr6::new(payload.ipv6()?, payload.u16()?);
            let addr4_set = payload.bool()?;
            let addr4 = TransportAddr4::new(payload.ipv4()?, payload.u16()?);

            let target = if addr4_set {
                Some(addr4)
            } else if addr6_set {
                engine.bib_find_by_6(addr6, l4)
            } else {
                return Err(Error::Control("remove requires an address".into()));
            };
            let Some(target) = target else {
                return Err(Error::NotFound(addr6.to_string()));
            };
            engine.bib_remove(target, l4)?;
            Ok(respond_ok(Writer::new(), false))
        }
        _ => unreachable!("operation was validated against the mode"),
    }
}

fn session_request(engine: &Nat64, operation: u8, payload: &mut Reader<'_>) -> Result<Vec<u8>> {
    let l4 = l4_from_wire(payload.u8()?)?;
    match operation {
        op::DISPLAY => {
            let cursor = read_cursor(payload)?;
            let (page, more) = engine.session_display(l4, cursor, DISPLAY_CHUNK);
            let mut out = Writer::new();
            out.u32(page.len() as u32);
            for session in page {
                out.ipv6(session.local6.addr)
                    .u16(session.local6.l4_id)
                    .ipv6(session.remote6.addr)
                    .u16(session.remote6.l4_id)
                    .ipv4(session.local4.addr)
                    .u16(session.local4.l4_id)
                    .ipv4(session.remote4.addr)
                    .u16(session.remote4.l4_id)
                    .u8(session.state as u8)
                    .u64(session.dying_time_ms);
            }
            Ok(respond_ok(out, more))
        }
        op::COUNT => {
            let mut out = Writer::new();
            out.u64(engine.session_count(l4) as u64);
            Ok(respond_ok(out, false))
        }
        _ => unreachable!("operation was validated against the mode"),
    }
}

fn general_request(engine: &Nat64, operation: u8, payload: &mut Reader<'_>) -> Result<Vec<u8>> {
    match operation {
        op::DISPLAY => {
            let config = engine.config().snapshot();
            let mut out = Writer::new();
            out.u64(config.sessiondb.ttl.udp.as_millis() as u64)
                .u64(config.sessiondb.ttl.icmp.as_millis() as u64)
                .u64(config.sessiondb.ttl.tcp_est.as_millis() as u64)
                .u64(config.sessiondb.ttl.tcp_trans.as_millis() as u64)
                .u64(config.pktqueue.max_pkts)
                .bool(config.filtering.drop_by_addr)
                .bool(config.filtering.drop_icmp6_info)
                .bool(config.filtering.drop_external_tcp)
                .bool(config.translate.reset_traffic_class)
                .bool(config.translate.reset_tos)
                .u8(config.translate.new_tos)
                .bool(config.translate.df_always_on)
                .bool(config.translate.build_ipv4_id)
                .bool(config.translate.lower_mtu_fail)
                .u16(config.translate.mtu_plateaus.len() as u16)
                .u16(config.translate.min_ipv6_mtu)
                .u64(config.fragmentation.fragment_timeout.as_millis() as u64);
            // The plateaus array follows the fixed portion; its length is
            // dictated by mtu_plateau_count above.
            for plateau in &config.translate.mtu_plateaus {
                out.u16(*plateau);
            }
            Ok(respond_ok(out, false))
        }
        op::UPDATE => {
            general_update(engine, payload)?;
            Ok(respond_ok(Writer::new(), false))
        }
        _ => unreachable!("operation was validated against the mode"),
    }
}

fn general_update(engine: &Nat64, payload: &mut Reader<'_>) -> Result<()> {
    let module = payload.u8()?;
    let field = payload.u8()?;

    match module {
        module::SESSIONDB => {
            let millis = payload.u64()?;
            let value = Duration::from_millis(millis);
            engine.config().update(|config| {
                let ttl = &mut config.sessiondb.ttl;
                match field {
                    0 => ttl.udp = value,
                    1 => ttl.icmp = value,
                    2 => ttl.tcp_est = value,
                    3 => ttl.tcp_trans = value,
                    other => return Err(Error::Control(format!("bogus timeout id {}", other))),
                }
                validate_ttls(ttl)
            })
        }
        module::PKTQUEUE => {
            if field != 0 {
                return Err(Error::Control(format!("bogus pktqueue field {}", field)));
            }
            let value = payload.u64()?;
            engine.config().update(|config| {
                config.pktqueue.max_pkts = value;
                Ok(())
            })?;
            engine.apply_pktqueue_config();
            Ok(())
        }
        module::FILTERING => {
            let value = payload.bool()?;
            engine.config().update(|config| {
                match field {
                    0 => config.filtering.drop_by_addr = value,
                    1 => config.filtering.drop_icmp6_info = value,
                    2 => config.filtering.drop_external_tcp = value,
                    other => return Err(Error::Control(format!("bogus filtering field {}", other))),
                }
                Ok(())
            })
        }
        module::TRANSLATE => general_update_translate(engine, field, payload),
        module::FRAGMENT => {
            if field != 0 {
                return Err(Error::Control(format!("bogus fragment field {}", field)));
            }
            let millis = payload.u64()?;
            engine.config().update(|config| {
                config.fragmentation.fragment_timeout = Duration::from_millis(millis);
                Ok(())
            })
        }
        other => Err(Error::Control(format!("bogus config module {}", other))),
    }
}

fn general_update_translate(engine: &Nat64, field: u8, payload: &mut Reader<'_>) -> Result<()> {
    match field {
        0..=5 => {
            let flag = payload.u8()?;
            engine.config().update(|config| {
                let translate = &mut config.translate;
                match field {
                    0 => translate.reset_traffic_class = flag != 0,
                    1 => translate.reset_tos = flag != 0,
                    2 => translate.new_tos = flag,
                    3 => translate.df_always_on = flag != 0,
                    4 => translate.build_ipv4_id = flag != 0,
                    _ => translate.lower_mtu_fail = flag != 0,
                }
                Ok(())
            })
        }
        6 => {
            if payload.remaining() == 0 || payload.remaining() % 2 != 0 {
                return Err(Error::Control(
                    "expected an array of 16-bit plateau values".into(),
                ));
            }
            let mut plateaus = Vec::with_capacity(payload.remaining() / 2);
            while payload.remaining() > 0 {
                plateaus.push(payload.u16()?);
            }
            engine.config().update(|config| {
                config.translate.mtu_plateaus = normalize_plateaus(plateaus.clone())?;
                Ok(())
            })
        }
        7 => {
            let value = payload.u16()?;
            engine.config().update(|config| {
                if value < 1280 {
                    return Err(Error::Config(
                        "min_ipv6_mtu cannot be below 1280".into(),
                    ));
                }
                config.translate.min_ipv6_mtu = value;
                Ok(())
            })
        }
        other => Err(Error::Control(format!("bogus translate field {}", other))),
    }
}

/// Serializes a request header; the userspace side of the protocol.
pub fn request_header(total_len: usize, mode: u8, operation: u8) -> Vec<u8> {
    let mut out = Writer::new();
    out.u32(total_len as u32).u8(mode).u8(operation);
    out.into_bytes()
}
