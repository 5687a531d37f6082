//! DNS message construction and parsing for wire-format DNS-over-HTTPS.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;
/// Bound on compression pointer hops while reading one name.
const MAX_POINTER_HOPS: usize = 16;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

/// A single-question DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Builds a recursive query for `domain`. Returns `None` for names that
    /// cannot be encoded.
    pub fn new(id: u16, domain: &str, qtype: u16) -> Option<Self> {
        let domain = domain.trim_end_matches('.').to_lowercase();
        if domain.is_empty() || domain.len() > MAX_NAME_LEN {
            return None;
        }
        if domain
            .split('.')
            .any(|label| label.is_empty() || label.len() > MAX_LABEL_LEN)
        {
            return None;
        }

        Some(Self {
            id,
            domain,
            qtype,
            qclass: CLASS_IN,
        })
    }

    /// Encode the query to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.domain.len() + 6);

        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x00]); // RD
        data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        encode_domain(&mut data, &self.domain);
        data.extend_from_slice(&self.qtype.to_be_bytes());
        data.extend_from_slice(&self.qclass.to_be_bytes());

        data
    }
}

/// A DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

/// A DNS question section entry.
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// The address carried by an A or AAAA record.
    pub fn address(&self) -> Option<IpAddr> {
        match (self.rtype, self.rdata.len()) {
            (TYPE_A, 4) => {
                let octets: [u8; 4] = self.rdata[..4].try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = self.rdata[..16].try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

impl DnsResponse {
    /// Response code (low 4 bits of the flags).
    pub fn rcode(&self) -> u16 {
        self.flags & 0x000F
    }

    /// Address and TTL of the first answer of type `rtype`.
    pub fn first_address(&self, rtype: u16) -> Option<(IpAddr, u32)> {
        self.answers
            .iter()
            .filter(|a| a.rtype == rtype)
            .find_map(|a| a.address().map(|ip| (ip, a.ttl)))
    }

    /// Parse a response from wire format. Returns `None` for queries and
    /// truncated or malformed packets.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        if flags & 0x8000 == 0 {
            return None;
        }
        let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
        let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

        let mut pos = HEADER_LEN;

        let mut questions = Vec::with_capacity(qdcount);
        for _ in 0..qdcount {
            let (domain, next) = read_name(data, pos)?;
            if next + 4 > data.len() {
                return None;
            }
            questions.push(DnsQuestion {
                domain,
                qtype: u16::from_be_bytes([data[next], data[next + 1]]),
                qclass: u16::from_be_bytes([data[next + 2], data[next + 3]]),
            });
            pos = next + 4;
        }

        let mut answers = Vec::with_capacity(ancount);
        for _ in 0..ancount {
            let (name, next) = read_name(data, pos)?;
            pos = next;

            // TYPE (2) + CLASS (2) + TTL (4) + RDLENGTH (2)
            if pos + 10 > data.len() {
                return None;
            }
            let rtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let class = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
            let ttl = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
            let rdlength = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as usize;
            pos += 10;

            if pos + rdlength > data.len() {
                return None;
            }
            answers.push(DnsRecord {
                name,
                rtype,
                class,
                ttl,
                rdata: data[pos..pos + rdlength].to_vec(),
            });
            pos += rdlength;
        }

        Some(Self {
            id,
            flags,
            questions,
            answers,
        })
    }

    /// Encode the response to wire format bytes. Used for canned answers in tests.
    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        for q in &self.questions {
            encode_domain(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        for a in &self.answers {
            // Use compression pointer if this is the first question's domain
            if !self.questions.is_empty() && a.name == self.questions[0].domain {
                data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
            } else {
                encode_domain(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Reads a possibly compressed name at `pos`; returns the name and the offset
/// just past it in the original position.
fn read_name(data: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut resume = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos)? as usize;
        match len {
            0 => {
                pos += 1;
                break;
            }
            l if l & 0xC0 == 0xC0 => {
                let low = *data.get(pos + 1)? as usize;
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return None;
                }
                resume.get_or_insert(pos + 2);
                pos = ((l & 0x3F) << 8) | low;
            }
            l if l <= MAX_LABEL_LEN => {
                let label = data.get(pos + 1..pos + 1 + l)?;
                labels.push(String::from_utf8_lossy(label).to_lowercase());
                pos += 1 + l;
            }
            _ => return None,
        }
    }

    Some((labels.join("."), resume.unwrap_or(pos)))
}
