use byteorder::{BigEndian, ByteOrder};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str;

use crate::errors::{DnsError, DnsResult};

// DNS packet constants
pub const DNS_HEADER_SIZE: usize = 12; // Size of the DNS header
pub const DNS_MAX_PACKET_SIZE: usize = 0x1600; // Maximum size of a DNS packet
pub const DNS_MAX_HOSTNAME_SIZE: usize = 256; // Maximum size of a hostname
pub const DNS_MAX_UDP_PACKET_SIZE: usize = 512; // Standard maximum UDP packet size (RFC 1035)

// DNS record types
pub const DNS_TYPE_A: u16 = 1;
pub const DNS_TYPE_NS: u16 = 2;
pub const DNS_TYPE_CNAME: u16 = 5;
pub const DNS_TYPE_SOA: u16 = 6;
pub const DNS_TYPE_PTR: u16 = 12;
pub const DNS_TYPE_MX: u16 = 15;
pub const DNS_TYPE_TXT: u16 = 16;
pub const DNS_TYPE_AAAA: u16 = 28;
#[allow(dead_code)]
pub const DNS_TYPE_OPT: u16 = 41;

// DNS classes
pub const DNS_CLASS_IN: u16 = 1;

// DNS response codes (RCODE)
pub const DNS_RCODE_NOERROR: u8 = 0;
#[allow(dead_code)]
pub const DNS_RCODE_FORMERR: u8 = 1;
pub const DNS_RCODE_SERVFAIL: u8 = 2;
pub const DNS_RCODE_NXDOMAIN: u8 = 3;
#[allow(dead_code)]
pub const DNS_RCODE_NOTIMP: u8 = 4;
#[allow(dead_code)]
pub const DNS_RCODE_REFUSED: u8 = 5;

// DNS header flags
const DNS_FLAGS_QR: u16 = 1u16 << 15; // Query/Response flag
const DNS_FLAGS_AA: u16 = 1u16 << 10; // Authoritative Answer flag
const DNS_FLAGS_TC: u16 = 1u16 << 9; // Truncation flag
const DNS_FLAGS_RD: u16 = 1u16 << 8; // Recursion Desired
const DNS_FLAGS_RA: u16 = 1u16 << 7; // Recursion Available flag
const DNS_FLAGS_AD: u16 = 1u16 << 5; // Authentic Data (DNSSEC)

// DNS opcodes (in bits 11-14 of the flags field)
pub const DNS_OPCODE_QUERY: u8 = 0;

const MAX_COMPRESSION_POINTERS: usize = 10;

/// The question section of a query, with the name kept in its original case
/// so responses can echo it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Typed RDATA for the record types this server inspects or synthesizes.
/// Everything else rides along as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(String),
    Cname(String),
    Ptr(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Txt(Vec<u8>),
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Raw(Vec<u8>),
}

/// A single resource record with decompressed names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

/// The three record sections of a response plus the header fields the
/// resolution pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub rcode: u8,
    pub aa: bool,
    pub ra: bool,
    pub ad: bool,
    pub answer: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Response {
    /// An empty response carrying only a response code
    pub fn with_rcode(rcode: u8) -> Self {
        Self {
            rcode,
            ..Self::default()
        }
    }
}

/// Returns the transaction ID from the DNS packet
#[inline]
pub fn tid(packet: &[u8]) -> u16 {
    BigEndian::read_u16(&packet[0..2])
}

#[inline]
fn qdcount(packet: &[u8]) -> u16 {
    BigEndian::read_u16(&packet[4..6])
}

#[inline]
fn ancount(packet: &[u8]) -> u16 {
    BigEndian::read_u16(&packet[6..8])
}

#[inline]
fn nscount(packet: &[u8]) -> u16 {
    BigEndian::read_u16(&packet[8..10])
}

#[inline]
fn arcount(packet: &[u8]) -> u16 {
    BigEndian::read_u16(&packet[10..DNS_HEADER_SIZE])
}

#[inline]
fn opcode(packet: &[u8]) -> u8 {
    (packet[2] >> 3) & 0x0F
}

/// Checks if the packet has the TC (truncated) bit set
#[inline]
pub fn is_truncated(packet: &[u8]) -> bool {
    packet.len() >= DNS_HEADER_SIZE
        && (BigEndian::read_u16(&packet[2..4]) & DNS_FLAGS_TC) == DNS_FLAGS_TC
}

/// Reads a possibly-compressed domain name starting at `offset`.
///
/// Returns the dotted name (root is ".") and the offset of the first byte
/// after the name at its original position. Pointers must aim strictly
/// backwards and are bounded, so malformed packets cannot loop.
fn read_name(packet: &[u8], offset: usize) -> DnsResult<(String, usize)> {
    let packet_len = packet.len();
    if offset >= packet_len {
        return Err(DnsError::PacketTooShort { offset });
    }

    let mut labels: Vec<String> = Vec::new();
    let mut name_len = 0usize;
    let mut pos = offset;
    let mut next: Option<usize> = None;
    let mut jumps = 0usize;

    loop {
        if pos >= packet_len {
            return Err(DnsError::PacketTooShort { offset: pos });
        }
        let len = packet[pos] as usize;
        if len & 0xc0 == 0xc0 {
            if pos + 1 >= packet_len {
                return Err(DnsError::PacketTooShort { offset: pos });
            }
            jumps += 1;
            if jumps > MAX_COMPRESSION_POINTERS {
                return Err(DnsError::TooManyCompressionPointers { count: jumps });
            }
            let pointer = ((len & 0x3f) << 8) | packet[pos + 1] as usize;
            if pointer >= pos {
                return Err(DnsError::InvalidCompressionPointer {
                    offset: pos,
                    pointer,
                    packet_size: packet_len,
                });
            }
            if next.is_none() {
                next = Some(pos + 2);
            }
            pos = pointer;
        } else if len == 0 {
            if next.is_none() {
                next = Some(pos + 1);
            }
            break;
        } else {
            if len > 63 {
                return Err(DnsError::LabelTooLong { length: len });
            }
            if pos + 1 + len > packet_len {
                return Err(DnsError::PacketTooShort { offset: pos });
            }
            name_len += len + 1;
            if name_len > DNS_MAX_HOSTNAME_SIZE {
                return Err(DnsError::DomainNameTooLong {
                    length: name_len,
                    max_length: DNS_MAX_HOSTNAME_SIZE,
                });
            }
            let label = str::from_utf8(&packet[pos + 1..pos + 1 + len])
                .map_err(|_| DnsError::InvalidDomainName("non-UTF-8 label".to_string()))?;
            labels.push(label.to_string());
            pos += 1 + len;
        }
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        labels.join(".")
    };

    // next is always set before the loop exits
    Ok((name, next.unwrap_or(pos + 1)))
}

/// Appends a domain name in uncompressed wire form
fn write_name(packet: &mut Vec<u8>, name: &str) -> DnsResult<()> {
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        packet.push(0);
        return Ok(());
    }

    let mut total = 0usize;
    for label in name.split('.') {
        if label.is_empty() {
            return Err(DnsError::InvalidDomainName(format!(
                "empty label in {name}"
            )));
        }
        if label.len() > 63 {
            return Err(DnsError::LabelTooLong {
                length: label.len(),
            });
        }
        total += label.len() + 1;
        if total > DNS_MAX_HOSTNAME_SIZE {
            return Err(DnsError::DomainNameTooLong {
                length: total,
                max_length: DNS_MAX_HOSTNAME_SIZE,
            });
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    Ok(())
}

fn is_valid_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'*'
}

fn validate_query_name(name: &str) -> DnsResult<()> {
    if name == "." {
        return Ok(());
    }
    if name.len() > DNS_MAX_HOSTNAME_SIZE {
        return Err(DnsError::DomainNameTooLong {
            length: name.len(),
            max_length: DNS_MAX_HOSTNAME_SIZE,
        });
    }
    for label in name.split('.') {
        if label.is_empty() {
            return Err(DnsError::InvalidDomainName(format!(
                "empty label in {name}"
            )));
        }
        for &c in label.as_bytes() {
            if !is_valid_name_char(c) {
                return Err(DnsError::InvalidDomainName(format!(
                    "invalid character {:?} in {name}",
                    c as char
                )));
            }
        }
    }
    Ok(())
}

/// Validates an inbound query packet and extracts its transaction ID,
/// RD flag and question.
pub fn decode_query(packet: &[u8]) -> DnsResult<(u16, bool, Question)> {
    if packet.len() < DNS_HEADER_SIZE {
        return Err(DnsError::PacketTooShort { offset: 0 });
    }
    if packet.len() > DNS_MAX_PACKET_SIZE {
        return Err(DnsError::PacketTooLarge {
            size: packet.len(),
            max_size: DNS_MAX_PACKET_SIZE,
        });
    }

    let flags = BigEndian::read_u16(&packet[2..4]);
    if flags & DNS_FLAGS_QR != 0 {
        return Err(DnsError::InvalidPacket(
            "response packet where a query was expected".to_string(),
        ));
    }
    let op = opcode(packet);
    if op != DNS_OPCODE_QUERY {
        return Err(DnsError::UnsupportedOperation(format!(
            "Unsupported opcode: {op}"
        )));
    }
    if qdcount(packet) != 1 {
        return Err(DnsError::InvalidPacket(
            "expected exactly one question".to_string(),
        ));
    }

    let (name, offset) = read_name(packet, DNS_HEADER_SIZE)
        .map_err(|e| DnsError::InvalidQuestion(format!("invalid question name: {e}")))?;
    validate_query_name(&name)?;

    if packet.len() < offset + 4 {
        return Err(DnsError::InvalidQuestion(
            "packet too short for QTYPE and QCLASS".to_string(),
        ));
    }
    let qtype = BigEndian::read_u16(&packet[offset..offset + 2]);
    let qclass = BigEndian::read_u16(&packet[offset + 2..offset + 4]);

    Ok((
        tid(packet),
        flags & DNS_FLAGS_RD != 0,
        Question {
            name,
            qtype,
            qclass,
        },
    ))
}

fn decode_rdata(packet: &[u8], rtype: u16, start: usize, rdlen: usize) -> DnsResult<RData> {
    let end = start + rdlen;
    let data = &packet[start..end];
    let rdata = match rtype {
        DNS_TYPE_A => {
            if rdlen != 4 {
                return Err(DnsError::InvalidRecord(format!(
                    "A record with RDLENGTH {rdlen}"
                )));
            }
            RData::A(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
        }
        DNS_TYPE_AAAA => {
            if rdlen != 16 {
                return Err(DnsError::InvalidRecord(format!(
                    "AAAA record with RDLENGTH {rdlen}"
                )));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(data);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        DNS_TYPE_NS => RData::Ns(read_name(packet, start)?.0),
        DNS_TYPE_CNAME => RData::Cname(read_name(packet, start)?.0),
        DNS_TYPE_PTR => RData::Ptr(read_name(packet, start)?.0),
        DNS_TYPE_MX => {
            if rdlen < 3 {
                return Err(DnsError::InvalidRecord(format!(
                    "MX record with RDLENGTH {rdlen}"
                )));
            }
            let preference = BigEndian::read_u16(&packet[start..start + 2]);
            let exchange = read_name(packet, start + 2)?.0;
            RData::Mx {
                preference,
                exchange,
            }
        }
        DNS_TYPE_SOA => {
            let (mname, offset) = read_name(packet, start)?;
            let (rname, offset) = read_name(packet, offset)?;
            if offset + 20 > end {
                return Err(DnsError::InvalidRecord(
                    "SOA record too short for its fixed fields".to_string(),
                ));
            }
            RData::Soa {
                mname,
                rname,
                serial: BigEndian::read_u32(&packet[offset..offset + 4]),
                refresh: BigEndian::read_u32(&packet[offset + 4..offset + 8]),
                retry: BigEndian::read_u32(&packet[offset + 8..offset + 12]),
                expire: BigEndian::read_u32(&packet[offset + 12..offset + 16]),
                minimum: BigEndian::read_u32(&packet[offset + 16..offset + 20]),
            }
        }
        DNS_TYPE_TXT => RData::Txt(data.to_vec()),
        _ => RData::Raw(data.to_vec()),
    };
    Ok(rdata)
}

fn read_rr(packet: &[u8], offset: usize) -> DnsResult<(ResourceRecord, usize)> {
    let (name, offset) = read_name(packet, offset)?;
    if packet.len() < offset + 10 {
        return Err(DnsError::PacketTooShort { offset });
    }
    let rtype = BigEndian::read_u16(&packet[offset..offset + 2]);
    let class = BigEndian::read_u16(&packet[offset + 2..offset + 4]);
    let ttl = BigEndian::read_u32(&packet[offset + 4..offset + 8]);
    let rdlen = BigEndian::read_u16(&packet[offset + 8..offset + 10]) as usize;

    let rdata_start = offset + 10;
    let rdata_end = rdata_start
        .checked_add(rdlen)
        .ok_or_else(|| DnsError::InvalidRecord("RDLENGTH overflow".to_string()))?;
    if packet.len() < rdata_end {
        return Err(DnsError::InvalidRecord(format!(
            "record data length ({rdlen}) exceeds packet bounds"
        )));
    }

    let rdata = decode_rdata(packet, rtype, rdata_start, rdlen)?;
    Ok((
        ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        },
        rdata_end,
    ))
}

/// Parses a response packet into typed sections.
///
/// Returns the transaction ID so callers can match it against the query
/// they sent.
pub fn decode_response(packet: &[u8]) -> DnsResult<(u16, Response)> {
    if packet.len() < DNS_HEADER_SIZE {
        return Err(DnsError::PacketTooShort { offset: 0 });
    }
    if packet.len() > DNS_MAX_PACKET_SIZE {
        return Err(DnsError::PacketTooLarge {
            size: packet.len(),
            max_size: DNS_MAX_PACKET_SIZE,
        });
    }

    let flags = BigEndian::read_u16(&packet[2..4]);
    if flags & DNS_FLAGS_QR == 0 {
        return Err(DnsError::InvalidPacket(
            "query packet where a response was expected".to_string(),
        ));
    }

    let mut offset = DNS_HEADER_SIZE;
    for _ in 0..qdcount(packet) {
        let (_, next) = read_name(packet, offset)
            .map_err(|e| DnsError::InvalidQuestion(format!("invalid question name: {e}")))?;
        if packet.len() < next + 4 {
            return Err(DnsError::InvalidQuestion(
                "packet too short for QTYPE and QCLASS".to_string(),
            ));
        }
        offset = next + 4;
    }

    let mut response = Response {
        rcode: packet[3] & 0x0F,
        aa: flags & DNS_FLAGS_AA != 0,
        ra: flags & DNS_FLAGS_RA != 0,
        ad: flags & DNS_FLAGS_AD != 0,
        ..Response::default()
    };

    for _ in 0..ancount(packet) {
        let (rr, next) = read_rr(packet, offset)?;
        response.answer.push(rr);
        offset = next;
    }
    for _ in 0..nscount(packet) {
        let (rr, next) = read_rr(packet, offset)?;
        response.authority.push(rr);
        offset = next;
    }
    for _ in 0..arcount(packet) {
        let (rr, next) = read_rr(packet, offset)?;
        response.additional.push(rr);
        offset = next;
    }

    Ok((tid(packet), response))
}

fn encode_rdata(rdata: &RData) -> DnsResult<Vec<u8>> {
    let mut buf = Vec::new();
    match rdata {
        RData::A(addr) => buf.extend_from_slice(&addr.octets()),
        RData::Aaaa(addr) => buf.extend_from_slice(&addr.octets()),
        RData::Ns(name) | RData::Cname(name) | RData::Ptr(name) => write_name(&mut buf, name)?,
        RData::Mx {
            preference,
            exchange,
        } => {
            buf.extend_from_slice(&preference.to_be_bytes());
            write_name(&mut buf, exchange)?;
        }
        RData::Soa {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            write_name(&mut buf, mname)?;
            write_name(&mut buf, rname)?;
            buf.extend_from_slice(&serial.to_be_bytes());
            buf.extend_from_slice(&refresh.to_be_bytes());
            buf.extend_from_slice(&retry.to_be_bytes());
            buf.extend_from_slice(&expire.to_be_bytes());
            buf.extend_from_slice(&minimum.to_be_bytes());
        }
        RData::Txt(data) | RData::Raw(data) => buf.extend_from_slice(data),
    }
    Ok(buf)
}

fn write_rr(packet: &mut Vec<u8>, rr: &ResourceRecord) -> DnsResult<()> {
    write_name(packet, &rr.name)?;
    packet.extend_from_slice(&rr.rtype.to_be_bytes());
    packet.extend_from_slice(&rr.class.to_be_bytes());
    packet.extend_from_slice(&rr.ttl.to_be_bytes());
    let rdata = encode_rdata(&rr.rdata)?;
    if rdata.len() > u16::MAX as usize {
        return Err(DnsError::InvalidRecord("RDATA too large".to_string()));
    }
    packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    packet.extend_from_slice(&rdata);
    Ok(())
}

fn write_question(packet: &mut Vec<u8>, question: &Question) -> DnsResult<()> {
    write_name(packet, &question.name)?;
    packet.extend_from_slice(&question.qtype.to_be_bytes());
    packet.extend_from_slice(&question.qclass.to_be_bytes());
    Ok(())
}

fn write_header(
    packet: &mut Vec<u8>,
    tid: u16,
    flags: u16,
    counts: (u16, u16, u16, u16),
) {
    packet.extend_from_slice(&tid.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&counts.0.to_be_bytes());
    packet.extend_from_slice(&counts.1.to_be_bytes());
    packet.extend_from_slice(&counts.2.to_be_bytes());
    packet.extend_from_slice(&counts.3.to_be_bytes());
}

/// Builds a query packet with RD set
pub fn encode_query(tid: u16, question: &Question) -> DnsResult<Vec<u8>> {
    let mut packet = Vec::with_capacity(DNS_HEADER_SIZE + question.name.len() + 6);
    write_header(&mut packet, tid, DNS_FLAGS_RD, (1, 0, 0, 0));
    write_question(&mut packet, question)?;
    Ok(packet)
}

/// Builds a response packet, echoing the question and without name
/// compression. Record counts that do not fit in the header are rejected.
pub fn encode_response(
    tid: u16,
    rd: bool,
    question: &Question,
    response: &Response,
) -> DnsResult<Vec<u8>> {
    let section_len = |section: &[ResourceRecord]| -> DnsResult<u16> {
        u16::try_from(section.len())
            .map_err(|_| DnsError::InvalidRecord("too many records for one packet".to_string()))
    };

    let mut flags = DNS_FLAGS_QR | (response.rcode as u16 & 0x0F);
    if rd {
        flags |= DNS_FLAGS_RD;
    }
    if response.aa {
        flags |= DNS_FLAGS_AA;
    }
    if response.ra {
        flags |= DNS_FLAGS_RA;
    }
    if response.ad {
        flags |= DNS_FLAGS_AD;
    }

    let mut packet = Vec::with_capacity(DNS_MAX_UDP_PACKET_SIZE);
    write_header(
        &mut packet,
        tid,
        flags,
        (
            1,
            section_len(&response.answer)?,
            section_len(&response.authority)?,
            section_len(&response.additional)?,
        ),
    );
    write_question(&mut packet, question)?;
    for rr in response
        .answer
        .iter()
        .chain(&response.authority)
        .chain(&response.additional)
    {
        write_rr(&mut packet, rr)?;
    }
    Ok(packet)
}

/// Builds an empty TC=1 response so UDP clients retry over TCP
pub fn truncated_response(tid: u16, rd: bool, question: &Question) -> DnsResult<Vec<u8>> {
    let mut flags = DNS_FLAGS_QR | DNS_FLAGS_TC;
    if rd {
        flags |= DNS_FLAGS_RD;
    }
    let mut packet = Vec::with_capacity(DNS_HEADER_SIZE + question.name.len() + 6);
    write_header(&mut packet, tid, flags, (1, 0, 0, 0));
    write_question(&mut packet, question)?;
    Ok(packet)
}
