//! DNS protocol packet builder and answer parser

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// DNS query builder
pub struct DnsQuery {
    transaction_id: u16,
    flags: u16,
    questions: Vec<DnsQuestion>,
}

#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: DnsType,
    pub qclass: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsType {
    A = 1,
    Cname = 5,
    Aaaa = 28,
}

impl DnsQuery {
    pub fn new() -> Self {
        Self {
            transaction_id: rand::random(),
            // standard query, recursion desired
            flags: 0x0100,
            questions: Vec::new(),
        }
    }

    pub fn transaction_id(mut self, id: u16) -> Self {
        self.transaction_id = id;
        self
    }

    pub fn id(&self) -> u16 {
        self.transaction_id
    }

    pub fn add_question(mut self, name: &str, qtype: DnsType) -> Self {
        self.questions.push(DnsQuestion {
            name: name.trim_end_matches('.').to_string(),
            qtype,
            qclass: 1,
        });
        self
    }

    fn encode_name(name: &str) -> Vec<u8> {
        let mut encoded = Vec::new();
        for label in name.split('.').filter(|l| !l.is_empty()) {
            encoded.push(label.len() as u8);
            encoded.extend_from_slice(label.as_bytes());
        }
        encoded.push(0);
        encoded
    }

    pub fn build(&self) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&self.transaction_id.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        packet.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        packet.extend_from_slice(&[0u8; 6]);
        for question in &self.questions {
            packet.extend(Self::encode_name(&question.name));
            packet.extend_from_slice(&(question.qtype as u16).to_be_bytes());
            packet.extend_from_slice(&question.qclass.to_be_bytes());
        }
        packet
    }

    pub fn a_query(domain: &str) -> Self {
        Self::new().add_question(domain, DnsType::A)
    }

    pub fn aaaa_query(domain: &str) -> Self {
        Self::new().add_question(domain, DnsType::Aaaa)
    }
}

impl Default for DnsQuery {
    fn default() -> Self {
        Self::new()
    }
}

/// Response codes that matter for caching decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    Refused,
    Other(u8),
}

impl From<u8> for DnsRcode {
    fn from(value: u8) -> Self {
        match value {
            0 => DnsRcode::NoError,
            1 => DnsRcode::FormErr,
            2 => DnsRcode::ServFail,
            3 => DnsRcode::NxDomain,
            5 => DnsRcode::Refused,
            other => DnsRcode::Other(other),
        }
    }
}

/// Addresses extracted from a DNS response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub id: u16,
    pub rcode: DnsRcode,
    pub addresses: Vec<IpAddr>,
    /// Smallest TTL among the address records
    pub min_ttl: Option<Duration>,
}

/// Parse the answer section of a DNS response, keeping A/AAAA records
pub fn parse_answer(packet: &[u8]) -> Result<DnsAnswer, String> {
    if packet.len() < 12 {
        return Err("DNS response shorter than header".to_string());
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 == 0 {
        return Err("DNS packet is not a response".to_string());
    }
    let rcode = DnsRcode::from((flags & 0x000f) as u8);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    let ancount = u16::from_be_bytes([packet[6], packet[7]]);

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    let mut addresses = Vec::new();
    let mut min_ttl: Option<u32> = None;
    for _ in 0..ancount {
        pos = skip_name(packet, pos)?;
        let fixed = packet
            .get(pos..pos + 10)
            .ok_or_else(|| "truncated resource record".to_string())?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += 10;
        let rdata = packet
            .get(pos..pos + rdlength)
            .ok_or_else(|| "truncated record data".to_string())?;
        pos += rdlength;

        let addr = match (rtype, rdlength) {
            (t, 4) if t == DnsType::A as u16 => {
                Some(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])))
            }
            (t, 16) if t == DnsType::Aaaa as u16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        };
        if let Some(addr) = addr {
            addresses.push(addr);
            min_ttl = Some(min_ttl.map_or(ttl, |m| m.min(ttl)));
        }
    }

    Ok(DnsAnswer {
        id,
        rcode,
        addresses,
        min_ttl: min_ttl.map(|t| Duration::from_secs(u64::from(t))),
    })
}

/// Advance past a (possibly compressed) domain name
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, String> {
    loop {
        let len = *packet
            .get(pos)
            .ok_or_else(|| "truncated domain name".to_string())?;
        match len {
            0 => return Ok(pos + 1),
            // compression pointer ends the name
            l if l & 0xc0 == 0xc0 => return Ok(pos + 2),
            l => pos += 1 + l as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a response to `query` carrying the given A records
    fn response_for(query: &[u8], rcode: u8, records: &[([u8; 4], u32)]) -> Vec<u8> {
        let mut packet = query.to_vec();
        packet[2] = 0x81;
        packet[3] = 0x80 | rcode;
        packet[6..8].copy_from_slice(&(records.len() as u16).to_be_bytes());
        for (ip, ttl) in records {
            packet.extend_from_slice(&[0xc0, 0x0c]); // pointer to question name
            packet.extend_from_slice(&1u16.to_be_bytes());
            packet.extend_from_slice(&1u16.to_be_bytes());
            packet.extend_from_slice(&ttl.to_be_bytes());
            packet.extend_from_slice(&4u16.to_be_bytes());
            packet.extend_from_slice(ip);
        }
        packet
    }

    #[test]
    fn test_dns_query_build() {
        let query = DnsQuery::a_query("example.com").transaction_id(0x1234);
        let packet = query.build();
        assert_eq!(&packet[0..2], &[0x12, 0x34]);
        assert_eq!(packet[5], 1); // one question
        // 12 header + 13 name + 4 type/class
        assert_eq!(packet.len(), 29);
    }

    #[test]
    fn test_trailing_dot_is_ignored() {
        let a = DnsQuery::a_query("example.com.").transaction_id(1).build();
        let b = DnsQuery::a_query("example.com").transaction_id(1).build();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_answer_with_compression() {
        let query = DnsQuery::a_query("example.com").transaction_id(7).build();
        let response = response_for(&query, 0, &[([93, 184, 216, 34], 300), ([93, 184, 216, 35], 60)]);

        let answer = parse_answer(&response).unwrap();
        assert_eq!(answer.id, 7);
        assert_eq!(answer.rcode, DnsRcode::NoError);
        assert_eq!(
            answer.addresses,
            vec![
                IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                IpAddr::V4(Ipv4Addr::new(93, 184, 216, 35)),
            ]
        );
        assert_eq!(answer.min_ttl, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_nxdomain() {
        let query = DnsQuery::a_query("nope.invalid").build();
        let answer = parse_answer(&response_for(&query, 3, &[])).unwrap();
        assert_eq!(answer.rcode, DnsRcode::NxDomain);
        assert!(answer.addresses.is_empty());
        assert_eq!(answer.min_ttl, None);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(parse_answer(&[0u8; 4]).is_err());

        let query = DnsQuery::a_query("example.com").build();
        let mut response = response_for(&query, 0, &[([1, 2, 3, 4], 10)]);
        response.truncate(response.len() - 2);
        assert!(parse_answer(&response).is_err());
    }

    #[test]
    fn test_query_is_not_a_response() {
        let query = DnsQuery::a_query("example.com").build();
        assert!(parse_answer(&query).is_err());
    }
}
