use std::ops::Range;

use rand::Rng;

/// Fixed DNS header size: id, flags, qd/an/ns/ar counts.
pub const HEADER_LEN: usize = 12;

/// Upper bound for a DNS message on either transport.
pub const MAX_MSG: usize = 4096;

/// 仅解析头部和第一个问题的位置，避免完整 Message 解析和分配开销
/// Minimal header + question-span parse, no allocation.
///
/// The question name is treated as an opaque byte string: no zero byte may
/// appear inside it except its terminator, so scanning for the first zero
/// locates the whole encoded name. Compression pointers are not followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgInfo {
    pub id: u16,
    pub qdcount: u16,
    /// Byte range of the encoded question name, terminator included.
    /// Empty unless the message carries exactly one question.
    pub qname: Range<usize>,
}

impl MsgInfo {
    /// Only single-question messages have a name this proxy will inspect.
    pub fn has_question(&self) -> bool {
        self.qdcount == 1
    }

    /// Question name bytes of `buf`, `None` when no single question is present.
    pub fn qname_bytes<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        if self.has_question() {
            buf.get(self.qname.clone())
        } else {
            None
        }
    }
}

/// Parse the fixed header and, for single-question messages, the question
/// name span. Returns `None` for anything too short to carry a header or for
/// a single-question message whose name runs past the buffer; such input is
/// dropped without reply.
pub fn parse_minimal(buf: &[u8]) -> Option<MsgInfo> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);

    if qdcount != 1 {
        // Forwardable, but carries no name this proxy will inspect or cache.
        return Some(MsgInfo {
            id,
            qdcount,
            qname: 0..0,
        });
    }

    // Name ends at its zero terminator; qtype and qclass must follow.
    let zero = buf[HEADER_LEN..].iter().position(|&b| b == 0)?;
    let name_end = HEADER_LEN + zero + 1;
    if name_end + 4 > buf.len() {
        return None;
    }
    Some(MsgInfo {
        id,
        qdcount,
        qname: HEADER_LEN..name_end,
    })
}

/// Case-fold an encoded question name in place. Label length prefixes are
/// never alphabetic bytes, so folding the whole region is safe.
pub fn fold_lowercase(name: &mut [u8]) {
    for b in name {
        b.make_ascii_lowercase();
    }
}

/// One random bit per alphabetic byte (0x20 encoding). The upstream must
/// echo the exact casing back, which turns the name into a second
/// anti-spoofing token next to the transaction id.
fn randomize_case<R: Rng>(rng: &mut R, name: &mut [u8]) {
    for b in name {
        if b.is_ascii_alphabetic() {
            if rng.r#gen::<bool>() {
                b.make_ascii_uppercase();
            } else {
                b.make_ascii_lowercase();
            }
        }
    }
}

/// The transformed query sent upstream, plus the exact tokens a response
/// must echo to be accepted.
#[derive(Debug)]
pub struct Outbound {
    pub packet: Vec<u8>,
    pub id: u16,
    /// Exact randomized name bytes as sent, terminator included.
    pub qname: Option<Vec<u8>>,
}

/// Build the upstream copy of a client query: fresh random transaction id,
/// drawn independently of the client's, and randomized name casing. The
/// client's buffer itself is never mutated.
pub fn prepare_outbound<R: Rng>(rng: &mut R, raw: &[u8], info: &MsgInfo) -> Outbound {
    let mut packet = raw.to_vec();
    let id: u16 = rng.r#gen();
    packet[0..2].copy_from_slice(&id.to_be_bytes());
    let qname = if info.has_question() {
        randomize_case(rng, &mut packet[info.qname.clone()]);
        Some(packet[info.qname.clone()].to_vec())
    } else {
        None
    };
    Outbound { packet, id, qname }
}

/// A response satisfies a pending query iff its transaction id matches the
/// one generated for that query and, when a name was sent, the echoed name
/// bytes match exactly (case-sensitive). Anything else is ignored and the
/// query keeps waiting.
pub fn validate_inbound(resp: &[u8], expected_id: u16, expected_name: Option<&[u8]>) -> bool {
    let Some(info) = parse_minimal(resp) else {
        return false;
    };
    if info.id != expected_id {
        return false;
    }
    match expected_name {
        None => true,
        Some(name) => info.qname_bytes(resp) == Some(name),
    }
}

/// Restore the client-visible identity of a validated (or cached) response:
/// the client's original transaction id and original name casing. Length
/// preserving by construction.
pub fn rewrite_for_client(resp: &mut [u8], client_id: u16, client_qname: Option<&[u8]>) {
    let Some(info) = parse_minimal(resp) else {
        return;
    };
    resp[0..2].copy_from_slice(&client_id.to_be_bytes());
    if let Some(name) = client_qname {
        if info.has_question() && info.qname.len() == name.len() {
            resp[info.qname].copy_from_slice(name);
        }
    }
}

/// Minimum TTL across the answer section, bounds-checking every read.
/// Compression pointers inside owner names terminate that name and are
/// skipped, never followed. Returns `None` when the walk cannot complete;
/// callers treat that as TTL 0 and do not cache long.
pub fn min_answer_ttl(resp: &[u8]) -> Option<u32> {
    if resp.len() < HEADER_LEN {
        return None;
    }
    let qdcount = u16::from_be_bytes([resp[4], resp[5]]);
    let ancount = u16::from_be_bytes([resp[6], resp[7]]);
    if ancount == 0 {
        return Some(0);
    }

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(resp, pos)?;
        pos += 4; // qtype + qclass
        if pos > resp.len() {
            return None;
        }
    }

    let mut min_ttl = u32::MAX;
    for _ in 0..ancount {
        pos = skip_name(resp, pos)?;
        // type(2) class(2) ttl(4) rdlength(2)
        if pos + 10 > resp.len() {
            return None;
        }
        let ttl = u32::from_be_bytes([resp[pos + 4], resp[pos + 5], resp[pos + 6], resp[pos + 7]]);
        min_ttl = min_ttl.min(ttl);
        let rdlen = u16::from_be_bytes([resp[pos + 8], resp[pos + 9]]) as usize;
        pos += 10 + rdlen;
        if pos > resp.len() {
            return None;
        }
    }
    Some(min_ttl)
}

fn skip_name(buf: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *buf.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            if pos + 2 > buf.len() {
                return None;
            }
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

/// Header-only SERVFAIL for the one failure mode that is answered instead of
/// dropped: an upstream connect that cannot work at all.
pub fn make_servfail(query: &[u8]) -> Option<[u8; HEADER_LEN]> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let mut pkt = [0u8; HEADER_LEN];
    pkt[0] = query[0];
    pkt[1] = query[1];
    pkt[2] = 0x80 | (query[2] & 0x01); // QR set, RD echoed
    pkt[3] = 0x02; // SERVFAIL
    Some(pkt)
}
